use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::types::{Cursor, Page};

/// How the next cursor is derived from the page just received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaginationStrategy {
    /// Advance by the number of items received; a short page is the last one.
    Offset,
    /// Follow the provider's `next` token; its absence is the end.
    Token,
    /// Prefer a `next` token when the provider sends one, else use offsets.
    #[default]
    Auto,
}

/// Result of [`PaginationStrategy::advance`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    Next(Cursor),
    Done,
}

impl PaginationStrategy {
    /// Compute the cursor after `page`, which was requested at `current` with
    /// `requested` items per page.
    pub fn advance<T>(self, current: &Cursor, page: &Page<T>, requested: usize) -> Advance {
        let received = page.data.len();
        if received == 0 || page.bare {
            return Advance::Done;
        }
        let token = page.next.as_deref().filter(|t| !t.is_empty());

        match (self, token) {
            (PaginationStrategy::Token | PaginationStrategy::Auto, Some(t)) => {
                Advance::Next(Cursor::Token(t.to_string()))
            }
            (PaginationStrategy::Token, None) => Advance::Done,
            (PaginationStrategy::Offset | PaginationStrategy::Auto, _) => {
                if received < requested {
                    return Advance::Done;
                }
                match current {
                    Cursor::Offset(o) => Advance::Next(Cursor::Offset(o + received as u64)),
                    // A token-paged provider stopped sending tokens: no offset to resume from.
                    Cursor::Token(_) => Advance::Done,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Item;

    fn page(n: usize) -> Page {
        Page::new((0..n).map(|i| Item::new(i.to_string())).collect())
    }

    #[test]
    fn offset_advances_by_received_count() {
        let s = PaginationStrategy::Offset;
        assert_eq!(
            s.advance(&Cursor::Offset(200), &page(100), 100),
            Advance::Next(Cursor::Offset(300))
        );
    }

    #[test]
    fn short_page_ends_offset_paging() {
        let s = PaginationStrategy::Offset;
        assert_eq!(s.advance(&Cursor::Offset(200), &page(37), 100), Advance::Done);
    }

    #[test]
    fn empty_page_always_ends() {
        for s in [PaginationStrategy::Offset, PaginationStrategy::Token, PaginationStrategy::Auto] {
            assert_eq!(s.advance(&Cursor::Offset(0), &page(0).with_next("abc"), 100), Advance::Done);
        }
    }

    #[test]
    fn token_strategy_stops_without_token() {
        let s = PaginationStrategy::Token;
        assert_eq!(
            s.advance(&Cursor::Offset(0), &page(100).with_next("t1"), 100),
            Advance::Next(Cursor::Token("t1".into()))
        );
        assert_eq!(s.advance(&Cursor::Token("t1".into()), &page(100), 100), Advance::Done);
    }

    #[test]
    fn token_wins_over_offset_in_auto() {
        let s = PaginationStrategy::Auto;
        // Even a short page continues when the provider says more data exists.
        assert_eq!(
            s.advance(&Cursor::Offset(0), &page(10).with_next("more"), 100),
            Advance::Next(Cursor::Token("more".into()))
        );
        assert_eq!(
            s.advance(&Cursor::Offset(0), &page(100), 100),
            Advance::Next(Cursor::Offset(100))
        );
    }

    #[test]
    fn bare_record_ends_paging() {
        for s in [PaginationStrategy::Offset, PaginationStrategy::Token, PaginationStrategy::Auto] {
            let one = Page::bare(serde_json::json!({"status": "OK"}));
            assert_eq!(s.advance(&Cursor::Offset(0), &one, 1), Advance::Done);
        }
    }

    #[test]
    fn offset_strategy_ignores_tokens() {
        let s = PaginationStrategy::Offset;
        assert_eq!(
            s.advance(&Cursor::Offset(0), &page(100).with_next("t"), 100),
            Advance::Next(Cursor::Offset(100))
        );
    }
}

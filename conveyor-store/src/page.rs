//! Cursor-keyed pagination.
//!
//! Pages are keyed by record ids, never offsets: `since` walks backwards
//! (older rows, id strictly below the cursor) and `until` walks forwards.

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Page {
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub limit: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pagination {
    pub previous: Option<Page>,
    pub next: Option<Page>,
}

/// Applies a page to ids sorted descending and computes the neighbouring
/// pages. Shared by every paginated listing in both store backends.
pub fn paginate<T, F: Fn(&T) -> i64>(rows_desc: Vec<T>, page: &Page, id_of: F) -> (Vec<T>, Pagination) {
    let limit = if page.limit == 0 { usize::MAX } else { page.limit };

    let all_ids: Vec<i64> = rows_desc.iter().map(&id_of).collect();

    let selected: Vec<T> = if let Some(until) = page.until {
        // forward walk: the newest `limit` rows strictly above the cursor
        let mut above: Vec<T> = rows_desc
            .into_iter()
            .filter(|r| id_of(r) > until)
            .collect();
        let keep = above.len().saturating_sub(limit);
        above.drain(..keep);
        above
    } else if let Some(since) = page.since {
        rows_desc
            .into_iter()
            .filter(|r| id_of(r) < since)
            .take(limit)
            .collect()
    } else {
        rows_desc.into_iter().take(limit).collect()
    };

    let pagination = match (selected.first(), selected.last()) {
        (Some(first), Some(last)) => {
            let first_id = id_of(first);
            let last_id = id_of(last);
            Pagination {
                previous: all_ids.iter().any(|&id| id > first_id).then_some(Page {
                    until: Some(first_id),
                    since: None,
                    limit: page.limit,
                }),
                next: all_ids.iter().any(|&id| id < last_id).then_some(Page {
                    since: Some(last_id),
                    until: None,
                    limit: page.limit,
                }),
            }
        }
        _ => Pagination::default(),
    };

    (selected, pagination)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(since: Option<i64>, until: Option<i64>, limit: usize) -> Page {
        Page {
            since,
            until,
            limit,
        }
    }

    #[test]
    fn first_page_is_newest_rows() {
        let rows: Vec<i64> = (1..=103).rev().collect();
        let (selected, pagination) = paginate(rows, &page(None, None, 100), |&id| id);

        assert_eq!(selected.len(), 100);
        assert_eq!(selected[0], 103);
        assert_eq!(selected[99], 4);
        assert_eq!(pagination.previous, None);
        assert_eq!(pagination.next.unwrap().since, Some(4));
    }

    #[test]
    fn since_walks_to_older_rows() {
        let rows: Vec<i64> = (1..=103).rev().collect();
        let (selected, pagination) = paginate(rows, &page(Some(4), None, 100), |&id| id);

        assert_eq!(selected, vec![3, 2, 1]);
        assert_eq!(pagination.previous.unwrap().until, Some(3));
        assert_eq!(pagination.next, None);
    }

    #[test]
    fn until_walks_to_newer_rows() {
        let rows: Vec<i64> = (1..=10).rev().collect();
        let (selected, pagination) = paginate(rows, &page(None, Some(3), 5), |&id| id);

        assert_eq!(selected, vec![8, 7, 6, 5, 4]);
        assert_eq!(pagination.previous.unwrap().until, Some(8));
        assert_eq!(pagination.next.unwrap().since, Some(4));
    }
}

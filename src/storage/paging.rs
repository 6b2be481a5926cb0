//! Paging arithmetic.

/// Number of pages needed to cover `total` items with pages of `page_size`.
///
/// A zero page size yields zero pages.
#[must_use]
pub const fn page_count(total: usize, page_size: usize) -> usize {
    if page_size == 0 {
        0
    } else {
        total.div_ceil(page_size)
    }
}

/// Applies offset and limit to an ordered list.
///
/// `offset == 0 && limit == 0` returns everything; otherwise `limit == 0`
/// means no upper bound.
#[must_use]
pub fn paginate<T>(items: Vec<T>, offset: usize, limit: usize) -> Vec<T> {
    let skipped = items.into_iter().skip(offset);
    if limit == 0 {
        skipped.collect()
    } else {
        skipped.take(limit).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_twelve_items_in_pages_of_five() {
        let items: Vec<usize> = (0..12).collect();
        assert_eq!(page_count(items.len(), 5), 3);

        let sizes: Vec<usize> = (0..3)
            .map(|page| paginate(items.clone(), page * 5, 5).len())
            .collect();
        assert_eq!(sizes, vec![5, 5, 2]);
    }

    #[test]
    fn test_zero_offset_and_limit_returns_all() {
        assert_eq!(paginate(vec![1, 2, 3], 0, 0), vec![1, 2, 3]);
        assert_eq!(paginate(vec![1, 2, 3], 1, 0), vec![2, 3]);
        assert!(paginate(vec![1, 2, 3], 5, 2).is_empty());
    }

    #[test]
    fn test_zero_page_size() {
        assert_eq!(page_count(10, 0), 0);
        assert_eq!(page_count(0, 5), 0);
    }

    proptest! {
        #[test]
        fn prop_pages_cover_every_item_once(total in 0usize..200, page_size in 1usize..20) {
            let items: Vec<usize> = (0..total).collect();
            let mut seen = Vec::with_capacity(total);
            for page in 0..page_count(total, page_size) {
                seen.extend(paginate(items.clone(), page * page_size, page_size));
            }
            prop_assert_eq!(seen, items);
        }
    }
}

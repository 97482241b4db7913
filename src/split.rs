//! R*-tree node splitting.
//!
//! Axis choice minimizes the sum of group margins over every admissible
//! distribution; on the chosen axis the distribution with the least overlap
//! between the two groups wins, ties broken by least total area. The
//! admissible distributions are bounded below by `split_distribution_factor`
//! so neither group can end up degenerate.

use crate::region::Region;

/// Anything with a spatial bounding box. Leaf and index entries implement
/// this so they share one split routine.
pub trait Bounded {
    fn bounds(&self) -> &Region;
}

/// Split an overflowing entry set into two groups per the R* procedure.
///
/// Panics if fewer than two entries are supplied; callers only split on
/// overflow, so anything less is a programming error.
pub fn rstar_split<E: Bounded>(
    entries: Vec<E>,
    split_distribution_factor: f64,
) -> (Vec<E>, Vec<E>) {
    let total = entries.len();
    assert!(total >= 2, "split requires at least two entries");
    let dimension = entries[0].bounds().dimension();

    let min_group = ((total as f64 * split_distribution_factor).ceil() as usize).clamp(1, total / 2);
    let distributions = total - 2 * min_group + 1;

    // Choose the split axis by minimum margin sum.
    let mut best_axis = 0;
    let mut best_margin = f64::INFINITY;
    for axis in 0..dimension {
        let mut margin = 0.0;
        for by_upper in [false, true] {
            let order = sorted_order(&entries, axis, by_upper);
            for k in 0..distributions {
                let split_at = min_group + k;
                margin += group_bounds(&entries, &order[..split_at]).margin()
                    + group_bounds(&entries, &order[split_at..]).margin();
            }
        }
        if margin < best_margin {
            best_margin = margin;
            best_axis = axis;
        }
    }

    // Choose the distribution on that axis by minimum overlap, then area.
    let mut best_order: Vec<usize> = Vec::new();
    let mut best_split = 0;
    let mut best_overlap = f64::INFINITY;
    let mut best_area = f64::INFINITY;
    for by_upper in [false, true] {
        let order = sorted_order(&entries, best_axis, by_upper);
        for k in 0..distributions {
            let split_at = min_group + k;
            let b1 = group_bounds(&entries, &order[..split_at]);
            let b2 = group_bounds(&entries, &order[split_at..]);
            let overlap = b1.intersecting_area(&b2);
            let area = b1.area() + b2.area();
            if overlap < best_overlap || (overlap == best_overlap && area < best_area) {
                best_overlap = overlap;
                best_area = area;
                best_order = order.clone();
                best_split = split_at;
            }
        }
    }

    let mut in_first = vec![false; total];
    for &i in &best_order[..best_split] {
        in_first[i] = true;
    }
    let mut first = Vec::with_capacity(best_split);
    let mut second = Vec::with_capacity(total - best_split);
    for (i, e) in entries.into_iter().enumerate() {
        if in_first[i] {
            first.push(e);
        } else {
            second.push(e);
        }
    }
    assert!(
        !first.is_empty() && !second.is_empty(),
        "split produced an empty group"
    );
    (first, second)
}

fn sorted_order<E: Bounded>(entries: &[E], axis: usize, by_upper: bool) -> Vec<usize> {
    let mut order: Vec<usize> = (0..entries.len()).collect();
    order.sort_by(|&a, &b| {
        let (ka, kb) = if by_upper {
            (entries[a].bounds().high[axis], entries[b].bounds().high[axis])
        } else {
            (entries[a].bounds().low[axis], entries[b].bounds().low[axis])
        };
        ka.partial_cmp(&kb).unwrap_or(std::cmp::Ordering::Equal)
    });
    order
}

fn group_bounds<E: Bounded>(entries: &[E], indices: &[usize]) -> Region {
    let mut mbr = Region::empty(entries[0].bounds().dimension());
    for &i in indices {
        mbr.combine(entries[i].bounds());
    }
    mbr
}

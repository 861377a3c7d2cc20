//! Proportional allocation of a sample size across strata.
//!
//! Largest-remainder apportionment: each stratum gets the floor of its exact
//! share, leftover seats go to the largest fractional remainders (ties to the
//! larger stratum, then the earlier one). Afterwards every non-empty stratum
//! is lifted to at least one seat, taken from the largest allocation, and no
//! stratum may exceed its population.

use std::cmp::Reverse;

/// Seats per stratum for a draw of `size` over `populations`.
///
/// The result always sums to `min(size, Σ populations)`.
pub fn allocate(populations: &[usize], size: usize) -> Vec<usize> {
    let total: usize = populations.iter().sum();
    if total <= size {
        return populations.to_vec();
    }
    let mut seats = vec![0usize; populations.len()];
    if size == 0 {
        return seats;
    }

    let non_empty = populations.iter().filter(|&&p| p > 0).count();
    if non_empty > size {
        // Not enough seats for one each: the largest strata win.
        let mut order: Vec<usize> = (0..populations.len()).filter(|&i| populations[i] > 0).collect();
        order.sort_by_key(|&i| (Reverse(populations[i]), i));
        for &i in order.iter().take(size) {
            seats[i] = 1;
        }
        return seats;
    }

    // Exact shares in integer arithmetic: share_i = pop_i * size / total.
    let mut remainders = Vec::with_capacity(populations.len());
    for (i, &pop) in populations.iter().enumerate() {
        let scaled = pop as u128 * size as u128;
        seats[i] = (scaled / total as u128) as usize;
        remainders.push((scaled % total as u128, i));
    }
    let assigned: usize = seats.iter().sum();
    remainders.sort_by_key(|&(rem, i)| (Reverse(rem), Reverse(populations[i]), i));
    for &(_, i) in remainders.iter().take(size - assigned) {
        seats[i] += 1;
    }

    // Minimum one per non-empty stratum.
    for i in 0..populations.len() {
        if populations[i] > 0 && seats[i] == 0 {
            if let Some(donor) = largest_allocation(&seats, populations, |s| s > 1) {
                seats[donor] -= 1;
                seats[i] = 1;
            }
        }
    }

    // Cap at population; overflow moves to the largest stratum with room.
    let mut overflow = 0;
    for (seat, &pop) in seats.iter_mut().zip(populations) {
        if *seat > pop {
            overflow += *seat - pop;
            *seat = pop;
        }
    }
    while overflow > 0 {
        let Some(target) = (0..populations.len())
            .filter(|&i| seats[i] < populations[i])
            .max_by_key(|&i| (populations[i], Reverse(i)))
        else {
            break;
        };
        let room = populations[target] - seats[target];
        let moved = room.min(overflow);
        seats[target] += moved;
        overflow -= moved;
    }

    seats
}

fn largest_allocation(seats: &[usize], populations: &[usize], eligible: impl Fn(usize) -> bool) -> Option<usize> {
    (0..seats.len())
        .filter(|&i| eligible(seats[i]))
        .max_by_key(|&i| (seats[i], populations[i], Reverse(i)))
}

//! Reduces raw hit counts to magnitude buckets.
//!
//! Counts of 1 and 2 are kept as they are, everything from 3 upwards is replaced by the
//! single-bit marker of its bucket. Consumers of the map compare these exact values, so the
//! table below must not change.

/// An inclusive range of hit counts and the marker that replaces them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HitBucket {
    pub lower: u8,
    pub upper: u8,
    pub marker: u8,
}

impl HitBucket {
    const fn new(lower: u8, upper: u8, marker: u8) -> Self {
        Self {
            lower,
            upper,
            marker,
        }
    }

    pub const fn contains(&self, count: u8) -> bool {
        count >= self.lower && count <= self.upper
    }
}

/// Evaluated in order. Counts outside every bucket (0, 1 and 2) are left untouched.
pub const HIT_BUCKETS: [HitBucket; 6] = [
    HitBucket::new(3, 3, 1 << 2),
    HitBucket::new(4, 7, 1 << 3),
    HitBucket::new(8, 15, 1 << 4),
    HitBucket::new(16, 31, 1 << 5),
    HitBucket::new(32, 127, 1 << 6),
    HitBucket::new(128, 255, 1 << 7),
];

/// Bucket marker for a single raw count.
pub const fn classify_count(count: u8) -> u8 {
    let mut i = 0;
    while i < HIT_BUCKETS.len() {
        if HIT_BUCKETS[i].contains(count) {
            return HIT_BUCKETS[i].marker;
        }
        i += 1;
    }
    count
}

const fn build_lookup() -> [u8; 256] {
    let mut lookup = [0u8; 256];
    let mut count = 0;
    while count < 256 {
        lookup[count] = classify_count(count as u8);
        count += 1;
    }
    lookup
}

static COUNT_CLASS_LOOKUP: [u8; 256] = build_lookup();

/// Classifies every counter of `map` in place.
///
/// The result holds markers, not counts, so classifying it again is meaningless.
pub fn classify_counts(map: &mut [u8]) {
    for count in map.iter_mut().filter(|count| **count != 0) {
        *count = COUNT_CLASS_LOOKUP[*count as usize];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn one_and_two_stay_literal() {
        assert_eq!(classify_count(0), 0);
        assert_eq!(classify_count(1), 1);
        assert_eq!(classify_count(2), 2);
    }

    #[test_log::test]
    fn bucket_boundaries() {
        let expected = [
            (3, 4),
            (4, 8),
            (7, 8),
            (8, 16),
            (15, 16),
            (16, 32),
            (31, 32),
            (32, 64),
            (127, 64),
            (128, 128),
            (200, 128),
            (255, 128),
        ];

        for (count, marker) in expected {
            assert_eq!(classify_count(count), marker, "count {count}");
        }
    }

    #[test_log::test]
    fn classification_is_monotonic() {
        let markers = (0..=255u8).map(classify_count).collect::<Vec<_>>();
        assert!(markers.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test_log::test]
    fn lookup_agrees_with_table() {
        for count in 0..=255u8 {
            assert_eq!(COUNT_CLASS_LOOKUP[count as usize], classify_count(count));
        }
    }

    #[test_log::test]
    fn classifies_map_in_place() {
        let mut map = [0, 1, 2, 3, 5, 9, 17, 100, 200, 0];
        classify_counts(&mut map);
        assert_eq!(map, [0, 1, 2, 4, 8, 16, 32, 64, 128, 0]);
    }
}

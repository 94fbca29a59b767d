//! Intervals, bounding boxes, and object-id ranges.
//!
//! A bounding box is a flattened slice of `d` intervals, one per
//! dimension; internal spatial pages store one box per child. Graph
//! trees use a single [`ObjectRange`] per child instead.

use crate::types::{Coord, ObjectId};

/// A closed interval along one dimension
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Interval {
    pub start: Coord,
    pub end: Coord,
}

impl Interval {
    /// The reverse-infinite interval that any expansion collapses onto
    pub const EMPTY: Interval = Interval {
        start: Coord::MAX,
        end: Coord::MIN,
    };

    /// Degenerate interval holding a single value
    pub fn point(v: Coord) -> Self {
        Self { start: v, end: v }
    }

    /// Whether `v` lies inside the interval
    pub fn covers_value(&self, v: Coord) -> bool {
        self.start <= v && v <= self.end
    }

    /// Whether `other` lies entirely inside the interval
    pub fn covers(&self, other: &Interval) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Whether the two intervals share any point
    pub fn overlaps(&self, other: &Interval) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Grow to include `v`; returns whether anything changed
    pub fn expand_to(&mut self, v: Coord) -> bool {
        let mut changed = false;
        if v < self.start {
            self.start = v;
            changed = true;
        }
        if v > self.end {
            self.end = v;
            changed = true;
        }
        changed
    }

    /// Grow to include `other`; returns whether anything changed
    pub fn expand(&mut self, other: &Interval) -> bool {
        let mut changed = false;
        if other.start < self.start {
            self.start = other.start;
            changed = true;
        }
        if other.end > self.end {
            self.end = other.end;
            changed = true;
        }
        changed
    }

    /// Length of the interval
    pub fn extent(&self) -> Coord {
        self.end - self.start
    }
}

/// Whether two keys are identical in every dimension
pub fn equal_keys(a: &[Coord], b: &[Coord]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x == y)
}

/// Whether a key lies inside a bounding box
pub fn key_in_box(key: &[Coord], bbox: &[Interval]) -> bool {
    key.iter()
        .zip(bbox)
        .all(|(k, interval)| interval.covers_value(*k))
}

/// Whether `inner` lies entirely inside `outer`
pub fn box_in_box(inner: &[Interval], outer: &[Interval]) -> bool {
    inner.iter().zip(outer).all(|(i, o)| o.covers(i))
}

/// Whether two bounding boxes share any point
pub fn boxes_overlap(a: &[Interval], b: &[Interval]) -> bool {
    a.iter().zip(b).all(|(x, y)| x.overlaps(y))
}

/// Volume added to `bbox` if it were expanded to cover `key`.
///
/// Per excluded dimension the increment is scaled by the box extents of
/// the other dimensions, so a zero-volume box expands for free; the
/// insertion path uses this to pick the cheapest subtree for an
/// uncovered key.
pub fn expansion_volume(key: &[Coord], bbox: &[Interval]) -> f64 {
    let mut volume = 0.0f64;
    for (i, interval) in bbox.iter().enumerate() {
        let increment = if key[i] < interval.start {
            (interval.start - key[i]) as f64
        } else if key[i] > interval.end {
            (key[i] - interval.end) as f64
        } else {
            0.0
        };

        if increment > 0.0 {
            let mut slab = increment;
            for (j, other) in bbox.iter().enumerate() {
                if j != i {
                    slab *= other.extent() as f64;
                }
            }
            volume += slab;
        }
    }
    volume
}

/// A closed range of object identifiers (graph variant)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectRange {
    pub start: ObjectId,
    pub end: ObjectId,
}

impl ObjectRange {
    /// Range that covers nothing until expanded
    pub const EMPTY: ObjectRange = ObjectRange {
        start: ObjectId::MAX,
        end: 0,
    };

    /// Degenerate range holding a single id
    pub fn point(id: ObjectId) -> Self {
        Self { start: id, end: id }
    }

    /// Whether `id` lies inside the range
    pub fn covers_value(&self, id: ObjectId) -> bool {
        self.start <= id && id <= self.end
    }

    /// Whether `other` lies entirely inside the range
    pub fn covers(&self, other: &ObjectRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Grow to include `id`; returns whether anything changed
    pub fn expand_to(&mut self, id: ObjectId) -> bool {
        let mut changed = false;
        if id < self.start {
            self.start = id;
            changed = true;
        }
        if id > self.end {
            self.end = id;
            changed = true;
        }
        changed
    }

    /// Grow to include `other`; returns whether anything changed
    pub fn expand(&mut self, other: &ObjectRange) -> bool {
        let mut changed = false;
        if other.start < self.start {
            self.start = other.start;
            changed = true;
        }
        if other.end > self.end {
            self.end = other.end;
            changed = true;
        }
        changed
    }

    /// Distance from `id` to the range (0 when covered)
    pub fn distance_to(&self, id: ObjectId) -> u64 {
        if id < self.start {
            self.start - id
        } else if id > self.end {
            id - self.end
        } else {
            0
        }
    }
}

/// Cover of a subtree: a bounding box (spatial) or an id range (graph).
///
/// Internal pages store one cover per child slot, and the tree caches
/// one for the root; the insertion, deletion, and split machinery is
/// written against this sum so both variants share it.
#[derive(Debug, Clone, PartialEq)]
pub enum Cover {
    Box(Vec<Interval>),
    Range(ObjectRange),
}

impl Cover {
    /// Cover of the given dimensionality that covers nothing
    pub fn empty_box(dimensions: u16) -> Self {
        Cover::Box(vec![Interval::EMPTY; dimensions as usize])
    }

    /// Range cover that covers nothing
    pub fn empty_range() -> Self {
        Cover::Range(ObjectRange::EMPTY)
    }

    /// Whether `other` lies entirely inside this cover
    pub fn covers(&self, other: &Cover) -> bool {
        match (self, other) {
            (Cover::Box(outer), Cover::Box(inner)) => box_in_box(inner, outer),
            (Cover::Range(outer), Cover::Range(inner)) => outer.covers(inner),
            _ => panic!("cover variant mismatch"),
        }
    }

    /// Grow to include `other`; returns whether anything changed
    pub fn expand(&mut self, other: &Cover) -> bool {
        match (self, other) {
            (Cover::Box(outer), Cover::Box(inner)) => {
                let mut changed = false;
                for (o, i) in outer.iter_mut().zip(inner) {
                    changed |= o.expand(i);
                }
                changed
            }
            (Cover::Range(outer), Cover::Range(inner)) => outer.expand(inner),
            _ => panic!("cover variant mismatch"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_cover_and_expand() {
        let mut iv = Interval::EMPTY;
        assert!(!iv.covers_value(0.0));
        assert!(iv.expand_to(2.0));
        assert!(iv.expand_to(-1.0));
        assert!(!iv.expand_to(1.0));
        assert_eq!(iv, Interval { start: -1.0, end: 2.0 });
        assert!(iv.covers(&Interval::point(0.5)));
        assert!(!iv.covers(&Interval { start: 0.0, end: 3.0 }));
    }

    #[test]
    fn test_key_in_box() {
        let bbox = [
            Interval { start: 0.0, end: 2.0 },
            Interval { start: -1.0, end: 1.0 },
        ];
        assert!(key_in_box(&[1.0, 0.0], &bbox));
        assert!(key_in_box(&[0.0, -1.0], &bbox));
        assert!(!key_in_box(&[3.0, 0.0], &bbox));
        assert!(!key_in_box(&[1.0, 1.5], &bbox));
    }

    #[test]
    fn test_box_relations() {
        let outer = [
            Interval { start: 0.0, end: 4.0 },
            Interval { start: 0.0, end: 4.0 },
        ];
        let inner = [
            Interval { start: 1.0, end: 2.0 },
            Interval { start: 1.0, end: 2.0 },
        ];
        let disjoint = [
            Interval { start: 5.0, end: 6.0 },
            Interval { start: 5.0, end: 6.0 },
        ];
        assert!(box_in_box(&inner, &outer));
        assert!(!box_in_box(&outer, &inner));
        assert!(boxes_overlap(&inner, &outer));
        assert!(!boxes_overlap(&outer, &disjoint));
    }

    #[test]
    fn test_expansion_volume() {
        let bbox = [
            Interval { start: 0.0, end: 2.0 },
            Interval { start: 0.0, end: 3.0 },
        ];
        // covered key costs nothing
        assert_eq!(expansion_volume(&[1.0, 1.0], &bbox), 0.0);
        // one dimension out by 1: slab scaled by the other extent
        assert_eq!(expansion_volume(&[3.0, 1.0], &bbox), 3.0);
        assert_eq!(expansion_volume(&[1.0, -2.0], &bbox), 4.0);
        // both out: slabs add up
        assert_eq!(expansion_volume(&[3.0, 4.0], &bbox), 5.0);
    }

    #[test]
    fn test_object_range() {
        let mut range = ObjectRange::EMPTY;
        assert!(!range.covers_value(0));
        range.expand_to(10);
        range.expand_to(20);
        assert!(range.covers_value(15));
        assert!(!range.covers_value(9));
        assert_eq!(range.distance_to(25), 5);
        assert_eq!(range.distance_to(4), 6);
        assert_eq!(range.distance_to(12), 0);
        assert!(range.covers(&ObjectRange { start: 11, end: 19 }));
    }
}

//! Contiguous partitions of a sequence, fewest parts first.

use std::ops::Range;

use itertools::{structs::Combinations, Itertools};

pub trait Partition<T> {
    fn partitions(&self) -> PartitionIterator<'_, T>;
}

impl<T> Partition<T> for [T] {
    fn partitions(&self) -> PartitionIterator<'_, T> {
        PartitionIterator::new(self)
    }
}

/// Yields every way to cut `source` into non-empty contiguous pieces.
///
/// Partitions with fewer pieces come first; partitions with the same number
/// of pieces come in lexicographic order of their cut points.
pub struct PartitionIterator<'a, T> {
    source: &'a [T],
    parts: usize,
    cuts: Option<Combinations<Range<usize>>>,
}

impl<'a, T> PartitionIterator<'a, T> {
    pub fn new(source: &'a [T]) -> Self {
        Self { source, parts: 0, cuts: None }
    }
}

impl<'a, T> Iterator for PartitionIterator<'a, T> {
    type Item = Vec<&'a [T]>;

    fn next(&mut self) -> Option<Self::Item> {
        let source = self.source;
        loop {
            if let Some(cuts) = self.cuts.as_mut().and_then(|c| c.next()) {
                let bounds: Vec<usize> = std::iter::once(0)
                    .chain(cuts)
                    .chain(std::iter::once(source.len()))
                    .collect();
                return Some(bounds.windows(2).map(|w| &source[w[0]..w[1]]).collect());
            }
            if self.parts >= source.len() {
                return None;
            }
            self.parts += 1;
            if self.parts == 1 {
                return Some(vec![source]);
            }
            self.cuts = Some((1..source.len()).combinations(self.parts - 1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty() {
        let a: Vec<usize> = vec![];
        assert_eq!(a.partitions().next(), None)
    }

    #[test]
    fn one() {
        let a: Vec<usize> = vec![1];
        let partitions: Vec<Vec<&[usize]>> = a.partitions().collect();
        let expected: Vec<Vec<&[usize]>> = vec![vec![&[1]]];
        assert_eq!(partitions, expected);
    }

    #[test]
    fn two() {
        let a: Vec<usize> = vec![1, 2];
        let partitions: Vec<Vec<&[usize]>> = a.partitions().collect();
        let expected: Vec<Vec<&[usize]>> = vec![vec![&[1, 2]], vec![&[1], &[2]]];
        assert_eq!(partitions, expected);
    }

    #[test]
    fn three() {
        let a: Vec<usize> = vec![1, 2, 3];
        let partitions: Vec<Vec<&[usize]>> = a.partitions().collect();
        let expected: Vec<Vec<&[usize]>> = vec![
            vec![&[1, 2, 3]],
            vec![&[1], &[2, 3]],
            vec![&[1, 2], &[3]],
            vec![&[1], &[2], &[3]],
        ];
        assert_eq!(partitions, expected);
    }

    #[test]
    fn counts_are_powers_of_two() {
        let a: Vec<usize> = (0..6).collect();
        assert_eq!(a.partitions().count(), 32);
        assert!(a.partitions().map(|p| p.len()).tuple_windows().all(|(x, y)| x <= y));
    }
}

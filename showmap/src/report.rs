use std::fmt;
use std::io::{self, Write};
use std::iter::FusedIterator;

/// A recorded tuple and its (possibly classified) count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tuple {
    pub index: usize,
    pub count: u8,
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:05}/{}", self.index, self.count)
    }
}

/// Read-only view over a coverage map after the target terminated.
#[derive(Debug, Clone, Copy)]
pub struct BitmapReporter<'a> {
    map: &'a [u8],
}

impl<'a> BitmapReporter<'a> {
    pub fn new(map: &'a [u8]) -> Self {
        Self { map }
    }

    /// Number of tuples hit at least once. Every non-zero byte counts as one, whatever its value.
    pub fn count_set_entries(&self) -> usize {
        self.map.iter().filter(|count| **count != 0).count()
    }

    /// The non-zero entries in ascending index order.
    pub fn enumerate(&self) -> Tuples<'a> {
        Tuples {
            inner: self.map.iter().enumerate(),
        }
    }

    /// Writes one `<index>/<count>` line per tuple and returns how many were written.
    pub fn write_tuples<W: Write>(&self, out: &mut W) -> io::Result<usize> {
        let mut written = 0;
        for tuple in self.enumerate() {
            writeln!(out, "{}", tuple)?;
            written += 1;
        }
        Ok(written)
    }
}

/// Single pass over the set entries of a map, see [`BitmapReporter::enumerate`].
#[derive(Debug)]
pub struct Tuples<'a> {
    inner: std::iter::Enumerate<std::slice::Iter<'a, u8>>,
}

impl Iterator for Tuples<'_> {
    type Item = Tuple;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner
            .by_ref()
            .find(|(_, count)| **count != 0)
            .map(|(index, count)| Tuple {
                index,
                count: *count,
            })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, self.inner.size_hint().1)
    }
}

impl FusedIterator for Tuples<'_> {}

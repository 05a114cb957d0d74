//! The set of component types that identifies an archetype.

use std::sync::Arc;
use std::{cmp, fmt};

use itertools::Itertools;

use crate::comp;

/// A sorted, deduplicated sequence of component descriptors.
///
/// Every archetype table is keyed by exactly one signature.
/// The order of descriptors passed to [`Signature::new`] does not matter.
///
/// Signatures are ordered by length first, then lexicographically by descriptor.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    types: Arc<[comp::Descriptor]>,
}

impl Signature {
    /// Creates a signature from descriptors in any order, possibly with duplicates.
    pub fn new(types: impl IntoIterator<Item = comp::Descriptor>) -> Self {
        Self { types: types.into_iter().sorted().dedup().collect() }
    }

    /// Creates a signature from descriptors that are already strictly ascending.
    pub(crate) fn from_sorted(types: impl IntoIterator<Item = comp::Descriptor>) -> Self {
        let types: Arc<[comp::Descriptor]> = types.into_iter().collect();
        debug_assert!(types.windows(2).all(|pair| pair[0] < pair[1]), "descriptors are not sorted");
        Self { types }
    }

    /// The number of component types.
    pub fn len(&self) -> usize { self.types.len() }

    /// Whether the signature has no component types.
    pub fn is_empty(&self) -> bool { self.types.is_empty() }

    /// The descriptors in column order.
    pub fn as_slice(&self) -> &[comp::Descriptor] { &self.types }

    /// Iterates over the descriptors in column order.
    pub fn iter(&self) -> impl Iterator<Item = &comp::Descriptor> + '_ { self.types.iter() }

    /// Returns the column index of `desc`, or `None` if it is not part of the signature.
    pub fn locate(&self, desc: &comp::Descriptor) -> Option<usize> { self.types.binary_search(desc).ok() }

    /// Whether `desc` is part of the signature.
    pub fn contains(&self, desc: &comp::Descriptor) -> bool { self.locate(desc).is_some() }

    /// Locates every element of a sorted `query` in a single merge pass.
    ///
    /// Returns `false` if any element of `query` is absent.
    /// If `output` is given, `output[k]` is set to the column index of `query[k]`;
    /// its contents are unspecified on failure.
    ///
    /// # Panics
    /// Panics if `output` is shorter than `query`.
    pub fn locate_ordered(&self, query: &[comp::Descriptor], mut output: Option<&mut [usize]>) -> bool {
        if let Some(output) = &output {
            assert!(output.len() >= query.len(), "output buffer is shorter than the query");
        }
        if query.len() > self.types.len() {
            return false;
        }

        let (mut i, mut k) = (0, 0);
        while i < self.types.len() && k < query.len() {
            match self.types[i].cmp(&query[k]) {
                cmp::Ordering::Equal => {
                    if let Some(output) = output.as_deref_mut() {
                        output[k] = i;
                    }
                    i += 1;
                    k += 1;
                }
                cmp::Ordering::Less => i += 1,
                cmp::Ordering::Greater => return false,
            }
        }

        k == query.len()
    }

    /// Locates every element of an unsorted `query` independently.
    ///
    /// Returns `false` if any element of `query` is absent.
    /// If `output` is given, `output[k]` is set to the column index of `query[k]`;
    /// its contents are unspecified on failure.
    ///
    /// # Panics
    /// Panics if `output` is shorter than `query`.
    pub fn locate_unordered(&self, query: &[comp::Descriptor], mut output: Option<&mut [usize]>) -> bool {
        if let Some(output) = &output {
            assert!(output.len() >= query.len(), "output buffer is shorter than the query");
        }

        for (k, desc) in query.iter().enumerate() {
            match self.locate(desc) {
                Some(index) => {
                    if let Some(output) = output.as_deref_mut() {
                        output[k] = index;
                    }
                }
                None => return false,
            }
        }

        true
    }
}

impl PartialOrd for Signature {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> { Some(self.cmp(other)) }
}

impl Ord for Signature {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.types.len().cmp(&other.types.len()).then_with(|| self.types.iter().cmp(other.types.iter()))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result { f.debug_set().entries(self.types.iter()).finish() }
}

impl<'t> IntoIterator for &'t Signature {
    type Item = &'t comp::Descriptor;
    type IntoIter = std::slice::Iter<'t, comp::Descriptor>;

    fn into_iter(self) -> Self::IntoIter { self.types.iter() }
}

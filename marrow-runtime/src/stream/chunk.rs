//! Chunks: the unit of transfer between stream stages.

use std::ops::Deref;

/// An immutable batch of stream elements.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Chunk<A> {
    items: Vec<A>,
}

impl<A> Chunk<A> {
    /// An empty chunk.
    pub fn empty() -> Self {
        Self { items: Vec::new() }
    }

    /// A chunk of one element.
    pub fn single(item: A) -> Self {
        Self { items: vec![item] }
    }

    /// Wrap a vector.
    pub fn from_vec(items: Vec<A>) -> Self {
        Self { items }
    }

    /// Unwrap into a vector.
    pub fn into_vec(self) -> Vec<A> {
        self.items
    }

    /// The elements as a slice.
    pub fn as_slice(&self) -> &[A] {
        &self.items
    }

    /// Split into the first `at` elements and the rest. `at` is clamped to
    /// the length.
    pub fn split_at(mut self, at: usize) -> (Chunk<A>, Chunk<A>) {
        let rest = self.items.split_off(at.min(self.items.len()));
        (self, Chunk::from_vec(rest))
    }

    /// Apply `f` to every element.
    pub fn map<B, F: FnMut(A) -> B>(self, f: F) -> Chunk<B> {
        Chunk::from_vec(self.items.into_iter().map(f).collect())
    }

    /// Keep the elements matching `pred`.
    pub fn filter<P: FnMut(&A) -> bool>(mut self, pred: P) -> Chunk<A> {
        self.items.retain(pred);
        self
    }

    /// Append `other`.
    pub fn concat(mut self, other: Chunk<A>) -> Chunk<A> {
        self.items.extend(other.items);
        self
    }
}

impl<A> Default for Chunk<A> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<A> Deref for Chunk<A> {
    type Target = [A];

    fn deref(&self) -> &[A] {
        &self.items
    }
}

impl<A> From<Vec<A>> for Chunk<A> {
    fn from(items: Vec<A>) -> Self {
        Self::from_vec(items)
    }
}

impl<A> From<Chunk<A>> for Vec<A> {
    fn from(chunk: Chunk<A>) -> Self {
        chunk.items
    }
}

impl<A> FromIterator<A> for Chunk<A> {
    fn from_iter<I: IntoIterator<Item = A>>(iter: I) -> Self {
        Self::from_vec(iter.into_iter().collect())
    }
}

impl<A> IntoIterator for Chunk<A> {
    type Item = A;
    type IntoIter = std::vec::IntoIter<A>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a, A> IntoIterator for &'a Chunk<A> {
    type Item = &'a A;
    type IntoIter = std::slice::Iter<'a, A>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

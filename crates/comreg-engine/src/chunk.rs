//! Work partitioning across registrar workers.

/// Upper bound on concurrently running registrar workers.
pub const MAX_CHUNKS: usize = 2;

/// Splits `items` into at most [`MAX_CHUNKS`] ordered, non-empty chunks.
/// The first chunk takes `ceil(n / 2)` items and the second the rest.
pub fn partition<T>(items: Vec<T>) -> Vec<Vec<T>> {
    if items.is_empty() {
        return Vec::new();
    }
    let size = items.len().div_ceil(MAX_CHUNKS);
    let mut chunks = Vec::with_capacity(MAX_CHUNKS);
    let mut items = items.into_iter().peekable();
    while items.peek().is_some() {
        chunks.push(items.by_ref().take(size).collect());
    }
    chunks
}

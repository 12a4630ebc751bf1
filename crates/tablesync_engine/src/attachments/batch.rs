//! Byte-capped batching for uploads.

/// Splits `items` into consecutive batches whose summed size stays within
/// `cap`. An item larger than `cap` travels alone.
pub fn partition_by_size<T>(items: Vec<T>, cap: u64, size: impl Fn(&T) -> u64) -> Vec<Vec<T>> {
    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut current_bytes = 0u64;

    for item in items {
        let bytes = size(&item);
        if !current.is_empty() && current_bytes.saturating_add(bytes) > cap {
            batches.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes = current_bytes.saturating_add(bytes);
        current.push(item);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

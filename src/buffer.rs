/// Ordered, append-only list of captured image data URIs.
///
/// Owned by an [`ExecutionContext`](crate::context::ExecutionContext). Sinks only
/// append; clearing happens through the context when the host begins a new
/// execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageBuffer {
    images: Vec<String>,
}

impl ImageBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry and return its index
    pub fn push(&mut self, data_uri: String) -> usize {
        self.images.push(data_uri);
        self.images.len() - 1
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.images.get(index).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.images.iter().map(String::as_str)
    }

    pub(crate) fn clear(&mut self) {
        self.images.clear();
    }

    /// Read and discard every entry, leaving the buffer empty
    pub(crate) fn take(&mut self) -> Vec<String> {
        std::mem::take(&mut self.images)
    }
}

impl Extend<String> for ImageBuffer {
    fn extend<I: IntoIterator<Item = String>>(&mut self, iter: I) {
        self.images.extend(iter);
    }
}

//! Table configuration.

/// Configuration for creating or opening a table.
#[derive(Debug, Clone)]
pub struct TableConfig {
    /// Data size at which the writable tail segment is frozen and a new
    /// tail is created.
    pub max_wr_seg_size: u64,

    /// Memory budget advertised for resident read-only data.
    pub readonly_data_mem_size: u64,

    /// Working-memory bound for one compression chunk during convert/purge.
    /// A colgroup larger than this is built as a multi-part store.
    pub compressing_work_mem_size: usize,

    /// Maximum number of segments a table may hold.
    pub max_segments: usize,

    /// Whether variable-length colgroups may use the dictionary-compressed
    /// store during convert/purge.
    pub enable_dict_zip: bool,

    /// Average record length above which a colgroup is dictionary-compressed
    /// even without an explicit request.
    pub dict_zip_min_avg_len: u64,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            max_wr_seg_size: 3 * 1024 * 1024 * 1024,
            readonly_data_mem_size: 2 * 1024 * 1024 * 1024,
            compressing_work_mem_size: 64 * 1024 * 1024,
            max_segments: 4095,
            enable_dict_zip: true,
            dict_zip_min_avg_len: 100,
        }
    }
}

impl TableConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the writable segment size limit.
    #[must_use]
    pub const fn max_wr_seg_size(mut self, bytes: u64) -> Self {
        self.max_wr_seg_size = bytes;
        self
    }

    /// Sets the read-only data memory budget.
    #[must_use]
    pub const fn readonly_data_mem_size(mut self, bytes: u64) -> Self {
        self.readonly_data_mem_size = bytes;
        self
    }

    /// Sets the compression chunk budget.
    #[must_use]
    pub const fn compressing_work_mem_size(mut self, bytes: usize) -> Self {
        self.compressing_work_mem_size = bytes;
        self
    }

    /// Sets the segment count limit.
    #[must_use]
    pub const fn max_segments(mut self, n: usize) -> Self {
        self.max_segments = n;
        self
    }

    /// Enables or disables the dictionary-compressed store.
    #[must_use]
    pub const fn enable_dict_zip(mut self, value: bool) -> Self {
        self.enable_dict_zip = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_pattern() {
        let config = TableConfig::new()
            .max_wr_seg_size(64)
            .max_segments(8)
            .enable_dict_zip(false);

        assert_eq!(config.max_wr_seg_size, 64);
        assert_eq!(config.max_segments, 8);
        assert!(!config.enable_dict_zip);
        assert_eq!(
            config.compressing_work_mem_size,
            TableConfig::default().compressing_work_mem_size
        );
    }
}

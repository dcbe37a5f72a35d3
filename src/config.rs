//! Pool configuration and flag sets (spec.md §6 Parameters, SPEC_FULL.md
//! §13). Grounded on the teacher's `EnvBuilder` (builder-style
//! construction) and `EnvFlags`/`DbFlags` (`bitflags!`, one doc comment
//! per flag).

use mpool_backend::MediaClass;

bitflags! {
    /// Flags recognized by `Pool::open` (spec.md §5 "exclusive vs shared
    /// mode").
    pub struct PoolOpenFlags: u32 {
        /// All subsequent opens of the same pool fail with `Busy` while
        /// this handle is live.
        const EXCLUSIVE = 0x01;
        /// Reject any operation that would mutate pool state.
        const READ_ONLY = 0x02;
    }
}

impl Default for PoolOpenFlags {
    fn default() -> Self {
        PoolOpenFlags::empty()
    }
}

bitflags! {
    /// Flags recognized by `Mdc::open` (spec.md §4.3 Open, §9
    /// "skip-serialization").
    pub struct MdcOpenFlags: u32 {
        /// Caller warrants single-threaded access; the engine performs
        /// no internal locking. Behavior under concurrent calls is
        /// undefined, matching spec.md §4.4 "Concurrency within an MDC".
        const SKIP_SERIALIZATION = 0x01;
        const READ_ONLY = 0x02;
    }
}

impl Default for MdcOpenFlags {
    fn default() -> Self {
        MdcOpenFlags::empty()
    }
}

/// Configuration values recognized at pool open (spec.md §6 Parameters).
/// Each field's `Default` value stands in for the source's "invalid
/// sentinel" (leave-default) convention.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub default_media_class: MediaClass,
    pub spare_capacity_ratio: f32,
    pub spare_storage_ratio: f32,
    pub read_ahead_pages: u32,
    pub mdc0_capacity: u64,
    pub per_mdc_capacity: u64,
    pub mdc_count: u32,
    pub label: Option<String>,
    pub runtime_dir: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            default_media_class: MediaClass::Capacity,
            spare_capacity_ratio: 0.0,
            spare_storage_ratio: 0.0,
            read_ahead_pages: 0,
            mdc0_capacity: 0,
            per_mdc_capacity: 0,
            mdc_count: 0,
            label: None,
            runtime_dir: None,
        }
    }
}

impl PoolConfig {
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder { config: PoolConfig::default() }
    }
}

/// Builder for `PoolConfig`, following the teacher's `EnvBuilder`.
pub struct PoolConfigBuilder {
    config: PoolConfig,
}

impl PoolConfigBuilder {
    pub fn default_media_class(mut self, class: MediaClass) -> Self {
        self.config.default_media_class = class;
        self
    }

    pub fn spare_capacity_ratio(mut self, ratio: f32) -> Self {
        self.config.spare_capacity_ratio = ratio;
        self
    }

    pub fn spare_storage_ratio(mut self, ratio: f32) -> Self {
        self.config.spare_storage_ratio = ratio;
        self
    }

    pub fn read_ahead_pages(mut self, pages: u32) -> Self {
        self.config.read_ahead_pages = pages;
        self
    }

    pub fn mdc0_capacity(mut self, capacity: u64) -> Self {
        self.config.mdc0_capacity = capacity;
        self
    }

    pub fn per_mdc_capacity(mut self, capacity: u64) -> Self {
        self.config.per_mdc_capacity = capacity;
        self
    }

    pub fn mdc_count(mut self, count: u32) -> Self {
        self.config.mdc_count = count;
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.config.label = Some(label.into());
        self
    }

    pub fn runtime_dir(mut self, dir: impl Into<String>) -> Self {
        self.config.runtime_dir = Some(dir.into());
        self
    }

    pub fn build(self) -> PoolConfig {
        self.config
    }
}

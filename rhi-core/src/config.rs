//! Tunables of a [`Device`](crate::Device).

/// How command contexts allocate shader-visible view descriptors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ViewHeapMode {
    /// Blocks of the global view heap, falling back to a context-local ring
    /// heap once the global heap runs out of blocks.
    #[default]
    SubAllocated,
    /// A context-local ring heap from the start.
    ThreadLocal,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct Settings {
    /// Descriptors in the global shader-visible view heap.
    pub global_view_heap_size: u32,
    /// Descriptors in one block handed out from the global view heap.
    pub online_block_size: u32,
    /// Descriptors in the global shader-visible sampler heap.
    pub global_sampler_heap_size: u32,
    pub local_view_heap_size: u32,
    pub local_sampler_heap_size: u32,
    pub view_heap_mode: ViewHeapMode,
    /// Reuse sampler tables already placed in the global sampler heap.
    pub sampler_table_cache: bool,
    /// Descriptors per offline heap page.
    pub offline_page_size: u32,
    /// Length of one CPU fence wait before a slow-wait warning is logged.
    pub fence_wait_slice_ms: u32,
    /// Total time a CPU fence wait may take before it fails.
    pub fence_wait_timeout_ms: u32,
    pub max_command_lists_per_batch: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            global_view_heap_size: 16 * 1024,
            online_block_size: 1024,
            global_sampler_heap_size: hal::MAX_SHADER_VISIBLE_SAMPLERS,
            local_view_heap_size: 4 * 1024,
            local_sampler_heap_size: hal::MAX_SHADER_VISIBLE_SAMPLERS,
            view_heap_mode: ViewHeapMode::default(),
            sampler_table_cache: true,
            offline_page_size: 256,
            fence_wait_slice_ms: 1000,
            fence_wait_timeout_ms: 30_000,
            max_command_lists_per_batch: 64,
        }
    }
}

impl Settings {
    /// Clamps values that would make the device unusable.
    pub(crate) fn sanitized(mut self) -> Self {
        if self.global_sampler_heap_size > hal::MAX_SHADER_VISIBLE_SAMPLERS {
            log::warn!(
                "Global sampler heap size {} exceeds the limit of {}",
                self.global_sampler_heap_size,
                hal::MAX_SHADER_VISIBLE_SAMPLERS
            );
            self.global_sampler_heap_size = hal::MAX_SHADER_VISIBLE_SAMPLERS;
        }
        self.local_sampler_heap_size = self
            .local_sampler_heap_size
            .min(hal::MAX_SHADER_VISIBLE_SAMPLERS);
        self.online_block_size = self
            .online_block_size
            .clamp(1, self.global_view_heap_size.max(1));
        self.offline_page_size = self.offline_page_size.max(1);
        self.fence_wait_slice_ms = self.fence_wait_slice_ms.max(1);
        self.max_command_lists_per_batch = self.max_command_lists_per_batch.max(1);
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sanitize_clamps_sampler_heaps() {
        let settings = Settings {
            global_sampler_heap_size: 1 << 20,
            online_block_size: 0,
            max_command_lists_per_batch: 0,
            ..Default::default()
        }
        .sanitized();
        assert_eq!(
            settings.global_sampler_heap_size,
            hal::MAX_SHADER_VISIBLE_SAMPLERS
        );
        assert_eq!(settings.online_block_size, 1);
        assert_eq!(settings.max_command_lists_per_batch, 1);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn partial_settings_fill_in_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{ "online_block_size": 64, "view_heap_mode": "ThreadLocal" }"#)
                .unwrap();
        assert_eq!(settings.online_block_size, 64);
        assert_eq!(settings.view_heap_mode, ViewHeapMode::ThreadLocal);
        assert_eq!(settings.offline_page_size, Settings::default().offline_page_size);
    }
}

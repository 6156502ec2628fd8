//! Guide directory backed by a map.

use guidepay_core::BoxFuture;
use guidepay_core::guide::{DirectoryError, GuideDirectory, GuideProfile};
use guidepay_core::types::GuideId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

/// [`GuideDirectory`] serving a fixed set of guides.
#[derive(Debug, Default)]
pub struct StaticGuideDirectory {
    guides: Mutex<HashMap<GuideId, GuideProfile>>,
    unavailable: AtomicBool,
}

impl StaticGuideDirectory {
    /// Directory containing `guides`.
    #[must_use]
    pub fn with_guides(guides: impl IntoIterator<Item = GuideProfile>) -> Self {
        Self {
            guides: Mutex::new(guides.into_iter().map(|g| (g.id, g)).collect()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Add or replace a guide.
    pub fn put(&self, guide: GuideProfile) {
        self.guides
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(guide.id, guide);
    }

    /// Make lookups fail.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }
}

impl GuideDirectory for StaticGuideDirectory {
    fn find_guide(
        &self,
        id: GuideId,
    ) -> BoxFuture<'_, Result<Option<GuideProfile>, DirectoryError>> {
        Box::pin(async move {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(DirectoryError("directory offline".to_string()));
            }
            Ok(self
                .guides
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&id)
                .cloned())
        })
    }
}

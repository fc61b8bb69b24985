//! Named client extensions, constructed once per client and cached.

use std::any::Any;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::client::GraphClient;
use crate::error::{GraphError, Result};

/// A pluggable extension bound to one [`GraphClient`].
pub trait GraphDriver: Send + Sync + 'static {
    /// Cache key; must be unique per driver type.
    const NAME: &'static str;

    /// Builds the driver. Called at most once per client and driver type.
    fn init(client: &GraphClient) -> Self
    where
        Self: Sized;
}

/// Per-client driver instances, keyed by [`GraphDriver::NAME`].
#[derive(Default)]
pub struct DriverCache {
    drivers: DashMap<&'static str, Arc<dyn Any + Send + Sync>>,
}

impl DriverCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached driver, constructing it on first use.
    pub fn get_or_init<D: GraphDriver>(&self, client: &GraphClient) -> Result<Arc<D>> {
        let existing = self.drivers.get(D::NAME).map(|d| d.value().clone());
        let driver = match existing {
            Some(d) => d,
            None => {
                // Built outside the map lock: a driver may request other drivers.
                let fresh: Arc<dyn Any + Send + Sync> = Arc::new(D::init(client));
                let stored = self.drivers.entry(D::NAME).or_insert(fresh).value().clone();
                debug!(driver = D::NAME, "driver initialized");
                stored
            }
        };
        driver.downcast::<D>().map_err(|_| {
            GraphError::invalid_argument(format!(
                "driver name '{}' is registered with a different type",
                D::NAME
            ))
        })
    }

    /// Number of drivers built so far.
    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    /// True before any driver was built.
    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }
}

impl std::fmt::Debug for DriverCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.drivers.iter().map(|e| *e.key()).collect();
        f.debug_struct("DriverCache").field("drivers", &names).finish()
    }
}

//! Application-observable events describing connection pool and topology activity.
//! Handlers are registered through the client options; every method has a no-op default,
//! so implementors subscribe only to what they care about.

pub mod cmap;
pub mod sdam;

use std::{fmt, sync::Arc};

use self::{cmap::CmapEventHandler, sdam::SdamEventHandler};

/// A reference to a CMAP event handler. Wraps the trait object so that option structs can
/// remain `Debug`.
#[derive(Clone)]
pub struct CmapEventHandlerRef(pub Arc<dyn CmapEventHandler>);

impl fmt::Debug for CmapEventHandlerRef {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str("CmapEventHandler")
    }
}

impl<T: CmapEventHandler + 'static> From<T> for CmapEventHandlerRef {
    fn from(handler: T) -> Self {
        Self(Arc::new(handler))
    }
}

/// A reference to an SDAM event handler.
#[derive(Clone)]
pub struct SdamEventHandlerRef(pub Arc<dyn SdamEventHandler>);

impl fmt::Debug for SdamEventHandlerRef {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str("SdamEventHandler")
    }
}

impl<T: SdamEventHandler + 'static> From<T> for SdamEventHandlerRef {
    fn from(handler: T) -> Self {
        Self(Arc::new(handler))
    }
}

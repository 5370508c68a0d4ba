use std::time::Duration;

use crate::{
    client::auth::Credential,
    compression::Compressor,
    error::Result,
    event::CmapEventHandlerRef,
    options::ClientOptions,
};

pub(crate) const DEFAULT_MAX_POOL_SIZE: u32 = 10;

/// The subset of client configuration a connection pool needs.
#[derive(Clone, Debug, Default)]
pub(crate) struct ConnectionPoolOptions {
    pub(crate) max_pool_size: Option<u32>,
    pub(crate) connect_timeout: Option<Duration>,
    pub(crate) socket_timeout: Option<Duration>,
    pub(crate) app_name: Option<String>,
    pub(crate) compressors: Vec<Compressor>,
    pub(crate) credential: Option<Credential>,
    pub(crate) cmap_event_handler: Option<CmapEventHandlerRef>,
}

impl ConnectionPoolOptions {
    pub(crate) fn from_client_options(options: &ClientOptions) -> Result<Self> {
        let compressors = match &options.compressors {
            Some(names) => {
                let compressors = Compressor::parse_list(names)?;
                for compressor in &compressors {
                    compressor.validate()?;
                }
                compressors
            }
            None => Vec::new(),
        };

        Ok(Self {
            max_pool_size: options.max_pool_size,
            connect_timeout: options.connect_timeout,
            socket_timeout: options.socket_timeout,
            app_name: options.app_name.clone(),
            compressors,
            credential: options.credential.clone(),
            cmap_event_handler: options.cmap_event_handler.clone(),
        })
    }

    pub(crate) fn max_pool_size(&self) -> u32 {
        self.max_pool_size.unwrap_or(DEFAULT_MAX_POOL_SIZE)
    }
}

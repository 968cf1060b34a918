// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::flexi_logger::{
    Logger,
    LoggerHandle,
};
use ::std::sync::{
    Mutex,
    Once,
};

//==============================================================================
// Static Variables
//==============================================================================

/// Guardian to the logging initialize function.
static INIT_LOG: Once = Once::new();

/// Keeps the logger alive for the lifetime of the process.
static LOG_HANDLE: Mutex<Option<LoggerHandle>> = Mutex::new(None);

//==============================================================================
// Standalone Functions
//==============================================================================

/// Initializes logging features. The log specification is taken from the RUST_LOG environment variable.
pub fn initialize() {
    INIT_LOG.call_once(|| {
        match Logger::try_with_env_or_str("").and_then(|logger: Logger| logger.start()) {
            Ok(handle) => {
                if let Ok(mut slot) = LOG_HANDLE.lock() {
                    *slot = Some(handle);
                }
            },
            // Another logger was installed first (e.g. by the embedding application).
            Err(e) => eprintln!("logging::initialize(): could not start logger: {}", e),
        }
    });
}

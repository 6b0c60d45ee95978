// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! # spacey-loader
//!
//! Typed-import handling for the Spacey module loader.
//!
//! Imports of types the runtime does not understand natively are decoded by
//! handlers, chosen per import or from a process-wide registry:
//!
//! - inline handlers passed at the import site
//! - handler modules whose default export is the handler
//! - registry defaults installed with `define`
//! - native host handlers, when the configured fallback policy allows
//!
//! Each (url, handler, type) is decoded at most once; concurrent imports of
//! the same triple share one handler invocation and one [`ModuleRecord`].
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use spacey_loader::{builtin, FallbackPolicy, ImportAssertion, ImportBindings, LoaderConfig, ModuleLoader};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let loader = ModuleLoader::builder(LoaderConfig::new(FallbackPolicy::NativeOnRegistryMiss)).build();
//!     loader.define(["csv"], builtin::csv_handler())?;
//!
//!     let record = loader
//!         .import("./a.csv", None, ImportAssertion::new("csv"), ImportBindings::Default("rows".into()))
//!         .await?;
//!     println!("{}", record.namespace());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod builtin;
pub mod cache;
pub mod config;
pub mod error;
pub mod handler;
pub mod invoker;
pub mod loader;
pub mod native;
pub mod record;
pub mod registry;
pub mod request;
pub mod resolver;
pub mod source;
pub mod stats;

// Re-exports
pub use cache::{CacheStatus, ModuleRecordCache};
pub use config::{FallbackPolicy, LoaderConfig};
pub use error::{ConfigError, ExecutionFailure, ImportError, Result};
pub use handler::{
    Encoding, Handler, HandlerContext, HandlerDescriptor, HandlerId, HandlerOrigin, ImportHandler,
};
pub use invoker::HandlerInvoker;
pub use loader::{ImportState, ModuleLoader, ModuleLoaderBuilder};
pub use native::{CapabilityTable, NativeCapabilities, NativeCheck};
pub use record::{CacheKey, ModuleRecord};
pub use registry::{HandlerRegistry, RegistryEntries, RegistryEntry};
pub use request::{
    HandlerReference, ImportAssertion, ImportBindings, ImportRequest, SpecifierResolver,
    UrlSpecifierResolver,
};
pub use resolver::{HandlerModule, HandlerResolver, ModuleExport, ModuleInstantiator, StaticModuleTable};
pub use source::{Fetcher, FileFetcher, MemoryFetcher, SourceAsset, SourceLoader};
pub use stats::LoaderStats;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Building blocks for queue-driven Kubernetes controllers
//!
//! The pieces fit together as follows:
//!
//! - an [`Informer`] watches one kind of object and keeps a [`Store`] of it up to date
//! - every change it observes is turned into an [`ObjectKey`] by an [`EventTranslator`]
//! - keys land in a deduplicating, rate-limited [`WorkQueue`]
//! - a [`Controller`] runs a pool of workers that call a [`Reconciler`] for each key,
//!   retrying failed keys with exponential backoff
//!
//! ```no_run
//! use aurora_runtime::{controller, Controller, EventTranslator, Informer, ObjectKey, Reconciler, Triggers};
//! use k8s_openapi::api::core::v1::ConfigMap;
//! use kube::{runtime::watcher, Api, Client};
//! use tokio_util::sync::CancellationToken;
//!
//! struct Printer;
//!
//! #[async_trait::async_trait]
//! impl Reconciler for Printer {
//!     type Error = kube::Error;
//!
//!     async fn reconcile(&self, key: &ObjectKey) -> Result<(), kube::Error> {
//!         println!("reconciling {key}");
//!         Ok(())
//!     }
//! }
//!
//! # async fn wrapper() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::try_default().await?;
//! let mut informer = Informer::new(Api::<ConfigMap>::all(client), watcher::Config::default());
//! let mut printer = Controller::new("printer", Printer, controller::Config::default());
//! printer.watches(&mut informer, EventTranslator::for_self(Triggers::APPLIED));
//!
//! let shutdown = CancellationToken::new();
//! tokio::spawn(informer.run(shutdown.clone().cancelled_owned()));
//! printer.run(shutdown.cancelled()).await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod controller;
pub mod event;
pub mod informer;
mod key;
pub mod scheduler;
pub mod store;
pub mod wait;
pub mod workqueue;

pub use backoff::ItemBackoff;
pub use controller::{Controller, Reconciler};
pub use event::{DeletedObject, EventTranslator, ResourceEvent, Tombstone, Triggers};
pub use informer::Informer;
pub use key::ObjectKey;
pub use store::{store, CacheSync, Store, Writer};
pub use workqueue::WorkQueue;

//! Off-chain runtime: multi-source chain funnel and deterministic block state machine.
//!
//! - **Funnel**: for every primary height, gathers the submitted inputs of the primary chain
//!   and the extension datums of every configured network (mapped onto that height by
//!   timestamp or slot), only once all of it is confirmed per [ConfirmationPolicy].
//!   Before the first height it presyncs each extension up to the primary start.
//! - **StateMachine**: applies one height in one store transaction: nonce filter, datum
//!   processors, due scheduled inputs, the application [StateTransition] with a per-block
//!   PRNG, then a chained block header and the progress cursor. Nothing of a failed block
//!   is ever visible.
//! - **Runtime**: the loop tying both together, with backoff, idle polling, an optional
//!   [HeadWatcher] wake-up and a progress watch channel.

pub mod config;
pub mod confirmation;
pub mod datum;
pub mod engine;
pub mod error;
pub mod extension;
pub mod funnel;
pub mod head_watcher;
pub mod primary;
pub mod prng;
pub mod processor;
pub mod reader;
pub mod runtime;
pub mod store;

pub use config::{ConfigError, ExtensionConfig, NodeConfig, ReconnectionConfig, PRIMARY_NETWORK};
pub use confirmation::{ConfirmationDepth, ConfirmationPolicy, MinimumAge, Strategy};
pub use datum::{ChainData, ChainDataExtensionDatum, DatumPayload, PresyncChainData, SubmittedInput};
pub use engine::{BlockReport, InputOrigin, StateMachine, StateTransition, StfInput, StfOutcome};
pub use error::EngineError;
pub use extension::{ChainDataExtension, ExtensionKind};
pub use funnel::Funnel;
pub use head_watcher::HeadWatcher;
pub use primary::{EvmPrimaryChain, PrimaryChain};
pub use prng::BlockRng;
pub use reader::{ChainSource, ExtensionReader, ReaderError, SourceRegistry};
pub use runtime::{IdleReason, Progress, Runtime, Tick};
pub use store::tables::{Table, Update};
pub use store::{BlockTx, Database, ReadOnlyDb, ReadTx, StoreError};

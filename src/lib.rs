//! # reprorun
//!
//! **A reproducible computation engine.**
//!
//! Given a declarative description of a computation — a *formula* naming
//! content-addressed input filesystems, an action to run in isolation,
//! and output filesystems to capture — the engine deterministically
//! materializes the inputs, executes the action inside an assembled
//! root filesystem, captures and content-addresses the outputs, and
//! emits a hashed *run record* documenting inputs, outputs, and outcome.
//!
//! Two runs of the same formula on compatible hosts produce
//! byte-identical output hashes for every output marked deterministic —
//! the formula's *conjecture*.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                           reprorun                             │
//! ├────────────────────────────────────────────────────────────────┤
//! │  formula ──► validate/default ──► conjecture hash (formulaHID) │
//! │     │                                                          │
//! │     ▼                                                          │
//! │  Transmats (dir │ tar │ cas │ git)                             │
//! │    materialize: warehouse failover → fetch → verify → arena    │
//! │    scan:        canonical walk → hash → commit everywhere      │
//! │     │                                                          │
//! │     ▼                                                          │
//! │  Assembler + Placers (copy │ bind │ overlay)                   │
//! │    shallowest-first placement, LIFO teardown                   │
//! │     │                                                          │
//! │     ▼                                                          │
//! │  Executor (chroot │ container runtime)                         │
//! │    pinned identity, exact env, muxed streams                   │
//! │     │                                                          │
//! │     ▼                                                          │
//! │  collect outputs ──► run record {UID, HID, results, failure?}  │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Reproducibility Model
//!
//! The conjecture covers input kinds, hashes, and mount paths, the
//! action, and conjecture-marked outputs. Warehouse coordinates are
//! deliberately excluded: data is expected to move, and a hash is
//! enough to verify it wherever it is found. Filters normalize the
//! classic sources of filesystem nondeterminism (uid, gid, mtime); host
//! mount escapes void the claims entirely.
//!
//! # Example
//!
//! ```rust,ignore
//! use reprorun::executor::{run_formula, ChrootExecutor, Executor};
//! use reprorun::formula::Formula;
//!
//! #[tokio::main]
//! async fn main() -> reprorun::Result<()> {
//!     let formula = Formula::from_document(std::fs::read("build.yaml")?.as_slice())?;
//!     let executor = ChrootExecutor::new(reprorun::executor::default_workspace())?;
//!     let outcome = run_formula(&executor, formula, None).await?;
//!     println!("{}", String::from_utf8_lossy(&outcome.record.encode()?));
//!     Ok(())
//! }
//! ```

pub mod assembler;
pub mod catalog;
pub mod constants;
pub mod cradle;
pub mod error;
pub mod executor;
pub mod filters;
pub mod formula;
mod fsutil;
pub mod hashing;
pub mod placer;
pub mod platform;
pub mod runrecord;
pub mod streamer;
pub mod transmat;
pub mod warehouse;

pub use error::{Error, Result};
pub use formula::Formula;
pub use runrecord::RunRecord;

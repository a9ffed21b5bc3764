#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::unused_async)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! gh-ado-codespaces library: the building blocks of a codespace session.
//!
//! - `feed`: NDJSON port event decoding from the remote monitor
//! - `forward`: one `gh codespace ports forward` child per remote port
//! - `registry`: local services exposed into the codespace via `-R`
//! - `broker`: credential, notification and URL-open relays
//! - `monitor`: the remote port monitor process
//! - `session`: startup, run and drain of one session
//! - `transport`: every `gh` invocation

pub mod broker;
pub mod cli;
pub mod codespace;
pub mod config;
pub mod feed;
pub mod forward;
pub mod logging;
pub mod monitor;
pub mod registry;
pub mod scripts;
pub mod session;
pub mod transport;
pub mod util;

// Library root
// -----------
// The `nimbu` binary is a thin wrapper around these modules.
//
// Module responsibilities:
// - `error`: API and local error types shared by every module.
// - `config`: host/site/theme resolution and the `nimbu.yml` project file.
// - `credentials`: per-host token storage under `~/.nimbu`.
// - `api`: blocking HTTP client for the Nimbu API, plus the `ThemeApi` and
//   `Simulator` traits the rest of the crate depends on.
// - `collector`: lists local theme files by kind.
// - `bundle`: the compressed template bundle sent to the simulator.
// - `themes`: list, diff, push and download of theme content.
// - `server`: the local development server and its helper watchers.
// - `ui`: interactive prompts and spinners.
// - `cli`: command registry and handlers.
pub mod api;
pub mod bundle;
pub mod cli;
pub mod collector;
pub mod config;
pub mod credentials;
pub mod error;
pub mod server;
pub mod themes;
pub mod ui;

//! CTF Forge pipeline stages.
//!
//! - [`forge`] turns raw challenge directories into `challenge.json`,
//!   `Dockerfile` and `docker-compose.yml` with the help of a chat model.
//! - [`metadata`] indexes the processed archive into `ctf_archive*.json`.
//! - [`writeups`] matches scraped writeups against that index.
//!
//! The remaining modules are the Dockerfile text tooling and prompt
//! builders the forge is made of.

pub mod docker_setup;
pub mod dockerfile;
pub mod forge;
pub mod generation;
pub mod metadata;
pub mod pool;
pub mod prompts;
pub mod writeups;

#[cfg(test)]
pub(crate) mod testutil;

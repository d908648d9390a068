//! The four externally reachable stages plus `clean`.
//!
//! `pre` and `post` bracket the build; `printenv` and `extract` run inside
//! it, once per target, invoked by the injected shell phases.

pub mod clean;
pub mod extract;
pub mod post;
pub mod pre;
pub mod printenv;

//! End-to-end tests: the full engine against the paper broker, driven by a
//! manual clock.

mod support;

mod control;
mod execution;
mod harvesting;
mod invariants;
mod recovery;

// SPDX-License-Identifier: AGPL-3.0-or-later

//! lurebot - pull request reviewer for LURE build recipes
//!
//! Receives GitHub pull request webhooks, evaluates every changed `lure.sh`
//! recipe in a sandbox, validates its metadata and posts the findings back
//! as a review.

pub mod config;
pub mod fetch;
pub mod finding;
pub mod forge;
pub mod github;
pub mod licenses;
pub mod queue;
pub mod report;
pub mod review;
pub mod rules;
pub mod sandbox;
pub mod webhook;
pub mod worker;

//! # ov-optimizer
//!
//! Configuration search for Olivine.
//!
//! Provides the search space derived from a run template, proposal strategies
//! (exhaustive, random, model-based, fixed), the search state machine that
//! enforces budgets and failure bounds, the footprint of evaluated
//! configurations with its Pareto frontier, and per-trial records.

mod driver;
mod footprint;
mod search;
mod trial;

pub use driver::{Proposal, Search, SearchLimits, SearchState, TrialOutcome};
pub use footprint::{Footprint, FootprintDocument, FootprintEntry, Selection};
pub use search::{
    BayesianSearch, Dimension, ExhaustiveSearch, FixedPipeline, RandomSearch, SearchSpace,
    SearchStrategy,
};
pub use trial::{SearchAlgorithm, SearchConfig, SearchStatus, Trial, TrialFailure, TrialStatus};

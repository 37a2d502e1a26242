/*
 * BMS Equipment Control Orchestrator
 * Licensed under the GNU General Public License, version 3 or later.
 */

pub mod documents;
pub mod timeseries;

pub use documents::DocumentStore;
pub use timeseries::TimeSeriesGateway;

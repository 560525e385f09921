// TSAGE - Tree sequence mutation age evaluation toolkit
// Copyright (C) 2024  Osma S. Rautila
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//
//
//

//! TSAGE - Tree sequence mutation age evaluation toolkit
//!
//! This library and program provide the tools used to evaluate how well methods dating
//! mutations from genealogies agree with simulated ground truth and with each other.
//!
//! For navigating the documentation of the available modules, see [the `Modules` section below](#modules).
//!
//! TSAGE toolkit commands
//!
//! * Simulate genealogies under the coalescent with recombination
//! * Inject empirical or flat genotyping error and ancestral state polarity error
//! * Convert genealogies and sample data to VCF
//! * Extract per-site mutation ages from a genealogy
//! * Align and compare mutation ages estimated by different methods
//! * Kendall-Colijn distance between two genealogies
//! * Set up and run whole evaluation experiments on a worker pool
//!
//! # Getting started
//!
//! ## Running TSAGE
//!
//! To print the available commands use:
//! ```bash
//! tsage --help
//! ```
//!
//! A minimal comparison of a genealogy against itself:
//! ```bash
//!tsage simulate -n 10 --length 100000 -m 1e-8 -r 1e-8 --seed 42 -o ${outdir}
//!
//!tsage mutation-ages -f ${outdir}/simulated.trees -o ${outdir}
//!
//!tsage kc-distance -f ${outdir}/simulated.trees ${outdir}/simulated.trees --lambda 0
//! ```
//!
//! Running a registered experiment end-to-end on 8 workers:
//! ```bash
//!tsage experiment neutral_simulated_mutation_accuracy --setup --inference -p 8
//! ```
//!

#[doc(hidden)]
pub mod args;

#[doc(hidden)]
pub mod io;

/// Tree sequence tables and local tree iteration
pub mod structs;

/// Append-then-finalise sample data container
pub mod sample_data;

#[doc(hidden)]
pub mod utils;

#[doc(hidden)]
pub mod stats;

#[doc(hidden)]
pub mod error;

#[cfg(feature = "clap")]
pub mod clap;

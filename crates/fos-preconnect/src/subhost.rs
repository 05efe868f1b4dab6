//! Subhost weighting record
//!
//! One host the main page fetched subresources from. The weight decays on
//! every load of the main page and grows with every reference, so hosts
//! that keep showing up stay above the pre-connect threshold.

use serde::{Deserialize, Serialize};

/// Default weight step per reference
pub const WEIGHT_INCREMENT: f64 = 0.33;

/// Default weight decay per load start
pub const WEIGHT_DECAY: f64 = 0.67;

/// Weight and reference counts of one subresource host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subhost {
    host: String,
    weight: f64,
    /// Resources fetched from the host during the current load
    number_of_references: u32,
    /// Count of the previous load, `None` until first measured
    old_number_of_references: Option<u32>,
}

impl Subhost {
    /// A host seen for the first time
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            weight: 1.0,
            number_of_references: 1,
            old_number_of_references: None,
        }
    }

    /// Snapshot of an existing host's statistics
    pub fn with_stats(host: &str, references: u32, weight: f64) -> Self {
        let weight = if weight > 0.0 { weight } else { 0.0 };
        Self {
            host: host.to_string(),
            weight,
            number_of_references: references,
            old_number_of_references: Some(references),
        }
    }

    /// Host name, with a port when not the default
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Current pre-connect weight
    pub fn weight(&self) -> f64 {
        self.weight
    }

    /// Smoothed reference count
    pub fn number_of_references(&self) -> u32 {
        self.number_of_references
    }

    /// Count of the previous load
    pub fn old_number_of_references(&self) -> Option<u32> {
        self.old_number_of_references
    }

    /// Count one more resource fetched from the host
    pub fn increment_references(&mut self) {
        self.number_of_references = self.number_of_references.saturating_add(1);
    }

    /// Grow the weight by `step`
    pub fn increment_weight(&mut self, step: f64) {
        self.weight += step;
    }

    /// Scale the weight down by `factor`
    pub fn decrement_weight(&mut self, factor: f64) {
        self.weight *= factor;
    }

    /// Start of a new load: remember the last count and start over
    pub fn reset_references(&mut self) {
        self.old_number_of_references = Some(self.number_of_references);
        self.number_of_references = 0;
    }

    /// End of a load: smooth the count with the previous load's
    pub fn update_references(&mut self) {
        match self.old_number_of_references {
            None => self.old_number_of_references = Some(self.number_of_references),
            Some(old) => {
                let sum = u64::from(self.number_of_references) + u64::from(old);
                self.number_of_references = (sum / 2) as u32;
            }
        }
    }
}

//! Offer selection
//!
//! Builds the marketplace query from [`InstanceRequirements`] and picks the
//! first offer of the provider-sorted result. The mandatory clauses are always
//! appended in the same order:
//!
//! ```text
//! <user query> disk_space>=<disk> direct_port_count>=<ports> rentable=True
//! ```

use crate::config::{InstanceRequirements, PortCountRule};
use crate::error::{Result, VastError};
use crate::provider::{Offer, OfferQuery, OfferQueryService};
use std::sync::Arc;
use tracing::{debug, info};

/// Build the textual offer query for a requirement set
pub fn build_query(req: &InstanceRequirements, rule: PortCountRule) -> String {
    let disk = format!("disk_space>={}", req.min_disk_gb);
    let ports = format!("direct_port_count{}{}", rule.operator(), req.required_ports);

    // split_whitespace also folds embedded newlines
    [req.query.as_str(), &disk, &ports, "rentable=True"]
        .iter()
        .flat_map(|part| part.split_whitespace())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Picks an offer matching the instance requirements
pub struct OfferSelector {
    service: Arc<dyn OfferQueryService>,
    port_rule: PortCountRule,
}

impl OfferSelector {
    pub fn new(service: Arc<dyn OfferQueryService>, port_rule: PortCountRule) -> Self {
        Self { service, port_rule }
    }

    /// Search request sent to the provider
    pub fn offer_query(&self, req: &InstanceRequirements) -> OfferQuery {
        OfferQuery {
            query: build_query(req, self.port_rule),
            pricing: req.pricing,
            order: req.sort.clone(),
            storage_gb: f64::from(req.min_disk_gb),
            no_default: false,
        }
    }

    /// Select the best offer
    ///
    /// Fails with [`VastError::NoMatch`] when nothing matches, or when a
    /// price cap is set and every match costs more than the cap.
    pub async fn select(&self, req: &InstanceRequirements) -> Result<Offer> {
        let query = self.offer_query(req);
        info!(query = %query.query, pricing = req.pricing.as_str(), "Searching offers");

        let offers = self.service.search_offers(&query).await?;
        debug!("Provider returned {} offers", offers.len());

        let Some(first) = offers.first() else {
            return Err(VastError::NoMatch(
                "No instances found with these parameters.".to_string(),
            ));
        };

        if req.max_price <= 0.0 {
            info!(offer_id = first.id, price = first.price, "Selected offer");
            return Ok(first.clone());
        }

        let cheapest = offers
            .iter()
            .map(|o| o.price)
            .fold(f64::INFINITY, f64::min);

        match offers.into_iter().find(|o| o.price <= req.max_price) {
            Some(offer) => {
                info!(offer_id = offer.id, price = offer.price, "Selected offer");
                Ok(offer)
            }
            None => Err(VastError::NoMatch(format!(
                "cheapest matching offer costs ${:.4}/h, above maxPrice ${:.4}/h",
                cheapest, req.max_price
            ))),
        }
    }
}

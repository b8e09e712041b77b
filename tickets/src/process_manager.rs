//! The VIP bundle saga.
//!
//! A bundle books show seats, then the inbound flight, then the return
//! flight, then a taxi. Any failure rolls back what was booked: tickets are
//! refunded and flight tickets canceled. State lives in the
//! [`VipBundleRepository`]; every step is driven by one event and sends the
//! next command, keyed deterministically by bundle and step so redelivered
//! events produce the same provider calls.
//!
//! ```text
//! VipBundleInitialized ─► BookShowTickets
//! BookingMade          ─► BookFlight (inbound)
//! FlightBooked inbound ─► BookFlight (return)
//! FlightBooked return  ─► BookTaxi
//! TaxiBooked           ─► VipBundleFinalized
//! BookingFailed | FlightBookingFailed | TaxiBookingFailed ─► rollback
//! ```

use crate::messages::{
    BookFlight, BookShowTickets, BookTaxi, BookingFailed, BookingMade, CancelFlightTickets,
    FlightBooked, FlightBookingFailed, RefundTicket, TaxiBooked, TaxiBookingFailed,
    TicketBookingConfirmed, VipBundleFinalized, VipBundleInitialized,
};
use crate::metrics;
use crate::types::{TicketId, VipBundleId};
use crate::vip_bundles::{VipBundle, VipBundleError, VipBundleRepository};
use anyhow::anyhow;
use std::sync::Arc;
use tickets_core::message::EventHeader;
use tickets_runtime::{CommandBus, EventBus, HandlerError};
use tracing::{debug, info, warn};
use uuid::Uuid;

fn step_key(vip_bundle_id: VipBundleId, step: &str) -> String {
    format!("{vip_bundle_id}-{step}")
}

fn refund_key(vip_bundle_id: VipBundleId, ticket_id: Uuid) -> String {
    format!("{vip_bundle_id}-refund-{ticket_id}")
}

fn parse_reference(reference_id: &str) -> Result<VipBundleId, HandlerError> {
    reference_id.parse().map_err(|_| {
        HandlerError::permanent(anyhow!("reference id '{reference_id}' is not a VIP bundle id"))
    })
}

/// Drives VIP bundles from purchase to finalization or rollback.
#[derive(Clone)]
pub struct VipBundleProcessManager {
    repository: Arc<dyn VipBundleRepository>,
    commands: CommandBus,
    events: EventBus,
}

impl VipBundleProcessManager {
    /// Creates the saga.
    #[must_use]
    pub fn new(repository: Arc<dyn VipBundleRepository>, commands: CommandBus, events: EventBus) -> Self {
        Self {
            repository,
            commands,
            events,
        }
    }

    /// Books the show seats of a new bundle.
    ///
    /// # Errors
    ///
    /// Returns a transient error while the bundle cannot be read or the
    /// command cannot be sent.
    pub async fn on_vip_bundle_initialized(&self, event: VipBundleInitialized) -> Result<(), HandlerError> {
        let bundle = self.repository.get(event.vip_bundle_id).await?;
        if bundle.is_finalized {
            debug!(vip_bundle_id = %bundle.vip_bundle_id, "Bundle already finalized");
            return Ok(());
        }

        self.commands
            .send(&BookShowTickets {
                header: EventHeader::with_idempotency_key(step_key(bundle.vip_bundle_id, "show-tickets")),
                booking_id: bundle.booking_id,
                customer_email: bundle.customer_email,
                number_of_tickets: bundle.number_of_tickets,
                show_id: bundle.show_id,
            })
            .await?;
        Ok(())
    }

    /// Records the committed booking and books the inbound flight.
    ///
    /// Bookings without a bundle are not VIP purchases and are ignored.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the store or the bus fails.
    pub async fn on_booking_made(&self, event: BookingMade) -> Result<(), HandlerError> {
        let booked_at = event.header.published_at;
        let update = |mut bundle: VipBundle| {
            if bundle.booking_made_at.is_none() {
                bundle.booking_made_at = Some(booked_at);
            }
            Ok::<_, VipBundleError>(bundle)
        };

        let bundle = match self.repository.update_by_booking_id(event.booking_id, &update).await {
            Ok(bundle) => bundle,
            Err(VipBundleError::NotFoundForBooking(booking_id)) => {
                debug!(%booking_id, "Booking is not part of a VIP bundle");
                return Ok(());
            },
            Err(e) => return Err(e.into()),
        };
        if bundle.is_finalized {
            debug!(vip_bundle_id = %bundle.vip_bundle_id, "Bundle already finalized");
            return Ok(());
        }

        info!(vip_bundle_id = %bundle.vip_bundle_id, "Show booked, booking inbound flight");
        let key = step_key(bundle.vip_bundle_id, "inbound-flight");
        let flight_id = bundle.inbound_flight_id;
        self.book_flight(bundle, flight_id, key).await
    }

    /// Records a confirmed ticket of the bundle's booking.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the store fails.
    pub async fn on_ticket_booking_confirmed(&self, event: TicketBookingConfirmed) -> Result<(), HandlerError> {
        let ticket_id = *event.ticket_id.as_uuid();
        let update = |mut bundle: VipBundle| {
            if !bundle.ticket_ids.contains(&ticket_id) {
                bundle.ticket_ids.push(ticket_id);
            }
            Ok::<_, VipBundleError>(bundle)
        };

        match self.repository.update_by_booking_id(event.booking_id, &update).await {
            Ok(_) => Ok(()),
            Err(VipBundleError::NotFoundForBooking(booking_id)) => {
                debug!(%booking_id, "Ticket is not part of a VIP bundle");
                Ok(())
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Rolls back a bundle whose show booking failed.
    ///
    /// # Errors
    ///
    /// Returns a transient error while rollback cannot complete.
    pub async fn on_booking_failed(&self, event: BookingFailed) -> Result<(), HandlerError> {
        match self.repository.get_by_booking_id(event.booking_id).await {
            Ok(bundle) => self.rollback(bundle.vip_bundle_id).await,
            Err(VipBundleError::NotFoundForBooking(booking_id)) => {
                debug!(%booking_id, "Failed booking is not part of a VIP bundle");
                Ok(())
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Records a booked flight leg and books the next step.
    ///
    /// # Errors
    ///
    /// Returns a permanent error for an unknown reference id or a flight that
    /// is neither leg of the bundle, or a transient error if the store or the
    /// bus fails.
    pub async fn on_flight_booked(&self, event: FlightBooked) -> Result<(), HandlerError> {
        let vip_bundle_id = parse_reference(&event.reference_id)?;
        let booked_at = event.header.published_at;
        let update = |mut bundle: VipBundle| {
            if bundle.is_finalized {
                return Ok(bundle);
            }
            let mut matched = false;
            if bundle.inbound_flight_id == event.flight_id {
                bundle.inbound_flight_booked_at.get_or_insert(booked_at);
                bundle.inbound_flight_ticket_ids.clone_from(&event.ticket_ids);
                matched = true;
            }
            if bundle.return_flight_id == event.flight_id {
                bundle.return_flight_booked_at.get_or_insert(booked_at);
                bundle.return_flight_ticket_ids.clone_from(&event.ticket_ids);
                matched = true;
            }
            if matched {
                Ok(bundle)
            } else {
                Err(VipBundleError::InvalidState(format!(
                    "flight {} is not part of bundle {}",
                    event.flight_id, bundle.vip_bundle_id
                )))
            }
        };

        let Some(bundle) = self.update_referenced(vip_bundle_id, &update).await? else {
            return Ok(());
        };
        if bundle.is_finalized {
            debug!(%vip_bundle_id, "Bundle already finalized");
            return Ok(());
        }

        match (bundle.inbound_flight_booked_at, bundle.return_flight_booked_at) {
            (Some(_), None) => {
                info!(%vip_bundle_id, "Inbound flight booked, booking return flight");
                let key = step_key(vip_bundle_id, "return-flight");
                let flight_id = bundle.return_flight_id;
                self.book_flight(bundle, flight_id, key).await
            },
            (Some(_), Some(_)) => {
                info!(%vip_bundle_id, "Both flights booked, booking taxi");
                let Some(customer_name) = bundle.passengers.first().cloned() else {
                    return Err(HandlerError::permanent(anyhow!(
                        "bundle {vip_bundle_id} has no passengers"
                    )));
                };
                self.commands
                    .send(&BookTaxi {
                        header: EventHeader::with_idempotency_key(step_key(vip_bundle_id, "taxi")),
                        customer_email: bundle.customer_email,
                        customer_name,
                        number_of_passengers: bundle.number_of_tickets,
                        reference_id: vip_bundle_id.to_string(),
                    })
                    .await?;
                Ok(())
            },
            (inbound, outbound) => Err(HandlerError::from(VipBundleError::InvalidState(format!(
                "return flight booked before inbound flight: inbound {inbound:?}, return {outbound:?}"
            )))),
        }
    }

    /// Rolls back a bundle whose flight booking failed.
    ///
    /// # Errors
    ///
    /// Returns a permanent error for an unknown reference id, or a transient
    /// error while rollback cannot complete.
    pub async fn on_flight_booking_failed(&self, event: FlightBookingFailed) -> Result<(), HandlerError> {
        warn!(reference_id = %event.reference_id, reason = %event.failure_reason, "Flight booking failed");
        let vip_bundle_id = parse_reference(&event.reference_id)?;
        self.rollback(vip_bundle_id).await
    }

    /// Records the taxi, finalizes the bundle and announces it.
    ///
    /// # Errors
    ///
    /// Returns a permanent error for an unknown reference id, or a transient
    /// error if the store or the bus fails.
    pub async fn on_taxi_booked(&self, event: TaxiBooked) -> Result<(), HandlerError> {
        let vip_bundle_id = parse_reference(&event.reference_id)?;
        let booked_at = event.header.published_at;
        let update = |mut bundle: VipBundle| {
            if !bundle.is_finalized {
                bundle.taxi_booked_at = Some(booked_at);
                bundle.taxi_booking_id = Some(event.taxi_booking_id);
                bundle.is_finalized = true;
            }
            Ok::<_, VipBundleError>(bundle)
        };

        let Some(bundle) = self.update_referenced(vip_bundle_id, &update).await? else {
            return Ok(());
        };
        if bundle.failed {
            warn!(%vip_bundle_id, "Taxi booked for a rolled back bundle");
            return Ok(());
        }

        self.events
            .publish(&VipBundleFinalized {
                header: EventHeader::with_idempotency_key(step_key(vip_bundle_id, "finalized")),
                vip_bundle_id,
            })
            .await?;
        metrics::record_bundle_finalized();
        info!(%vip_bundle_id, "VIP bundle finalized");
        Ok(())
    }

    /// Rolls back a bundle whose taxi booking failed.
    ///
    /// # Errors
    ///
    /// Returns a permanent error for an unknown reference id, or a transient
    /// error while rollback cannot complete.
    pub async fn on_taxi_booking_failed(&self, event: TaxiBookingFailed) -> Result<(), HandlerError> {
        warn!(reference_id = %event.reference_id, reason = %event.failure_reason, "Taxi booking failed");
        let vip_bundle_id = parse_reference(&event.reference_id)?;
        self.rollback(vip_bundle_id).await
    }

    async fn book_flight(&self, bundle: VipBundle, flight_id: Uuid, key: String) -> Result<(), HandlerError> {
        self.commands
            .send(&BookFlight {
                header: EventHeader::with_idempotency_key(key),
                customer_email: bundle.customer_email,
                flight_id,
                passengers: bundle.passengers,
                reference_id: bundle.vip_bundle_id.to_string(),
            })
            .await?;
        Ok(())
    }

    /// Applies `update` to a bundle referenced by a provider event. `None`
    /// means the reference names no bundle.
    async fn update_referenced(
        &self,
        vip_bundle_id: VipBundleId,
        update: crate::vip_bundles::BundleUpdate<'_>,
    ) -> Result<Option<VipBundle>, HandlerError> {
        match self.repository.update_by_id(vip_bundle_id, update).await {
            Ok(bundle) => Ok(Some(bundle)),
            Err(VipBundleError::NotFound(id)) => {
                warn!(vip_bundle_id = %id, "Event references an unknown VIP bundle");
                Ok(None)
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Refunds confirmed tickets, cancels booked flights and marks the
    /// bundle failed. Safe to repeat: a failed bundle is left alone, and the
    /// compensating commands carry deterministic keys.
    async fn rollback(&self, vip_bundle_id: VipBundleId) -> Result<(), HandlerError> {
        let bundle = match self.repository.get(vip_bundle_id).await {
            Ok(bundle) => bundle,
            Err(VipBundleError::NotFound(id)) => {
                warn!(vip_bundle_id = %id, "Cannot roll back an unknown VIP bundle");
                return Ok(());
            },
            Err(e) => return Err(e.into()),
        };
        if bundle.failed {
            debug!(%vip_bundle_id, "Bundle already rolled back");
            return Ok(());
        }
        if bundle.is_finalized {
            warn!(%vip_bundle_id, "Bundle already finalized, not rolling back");
            return Ok(());
        }

        warn!(%vip_bundle_id, "Rolling back VIP bundle");
        if bundle.booking_made_at.is_some() {
            let confirmed = bundle.ticket_ids.len();
            let expected = usize::try_from(bundle.number_of_tickets).unwrap_or(usize::MAX);
            if confirmed != expected {
                return Err(HandlerError::transient(anyhow!(
                    "bundle {vip_bundle_id} has {confirmed} of {expected} tickets confirmed, waiting for the rest"
                )));
            }
            for ticket_id in &bundle.ticket_ids {
                self.commands
                    .send(&RefundTicket {
                        header: EventHeader::with_idempotency_key(refund_key(vip_bundle_id, *ticket_id)),
                        ticket_id: TicketId::from_uuid(*ticket_id),
                    })
                    .await?;
            }
        }
        if bundle.inbound_flight_booked_at.is_some() {
            self.cancel_flight(vip_bundle_id, "cancel-inbound", &bundle.inbound_flight_ticket_ids)
                .await?;
        }
        if bundle.return_flight_booked_at.is_some() {
            self.cancel_flight(vip_bundle_id, "cancel-return", &bundle.return_flight_ticket_ids)
                .await?;
        }

        let update = |mut bundle: VipBundle| {
            bundle.is_finalized = true;
            bundle.failed = true;
            Ok::<_, VipBundleError>(bundle)
        };
        self.repository.update_by_id(vip_bundle_id, &update).await?;
        metrics::record_bundle_rolled_back();
        info!(%vip_bundle_id, "VIP bundle rolled back");
        Ok(())
    }

    async fn cancel_flight(
        &self,
        vip_bundle_id: VipBundleId,
        step: &str,
        ticket_ids: &[Uuid],
    ) -> Result<(), HandlerError> {
        self.commands
            .send(&CancelFlightTickets {
                header: EventHeader::with_idempotency_key(step_key(vip_bundle_id, step)),
                flight_ticket_ids: ticket_ids.to_vec(),
            })
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for VipBundleProcessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VipBundleProcessManager").finish_non_exhaustive()
    }
}

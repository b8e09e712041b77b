//! Business metrics of the tickets service.
//!
//! # Exported Metrics
//!
//! ## Counters
//! - `tickets_bookings_total{outcome}` - Ledger bookings by outcome (booked,
//!   redelivered, sold_out)
//! - `tickets_seats_booked_total` - Seats committed to the ledger
//! - `tickets_vip_bundles_total{status}` - Bundles by status (started,
//!   finalized, rolled_back)
//! - `tickets_refunds_total` - Show tickets refunded
//! - `tickets_read_model_rebuild_events_total{result}` - Archived events
//!   replayed by a rebuild (applied, skipped, unresolved)
//!
//! Recording without an installed recorder is a no-op.

use metrics::describe_counter;

const BOOKINGS: &str = "tickets_bookings_total";
const SEATS_BOOKED: &str = "tickets_seats_booked_total";
const VIP_BUNDLES: &str = "tickets_vip_bundles_total";
const REFUNDS: &str = "tickets_refunds_total";
const REBUILD_EVENTS: &str = "tickets_read_model_rebuild_events_total";

/// Registers the descriptions of every business metric.
///
/// Call once at startup, after the recorder is installed.
pub fn register_business_metrics() {
    describe_counter!(BOOKINGS, "Ledger bookings by outcome (booked, redelivered, sold_out)");
    describe_counter!(SEATS_BOOKED, "Seats committed to the ledger");
    describe_counter!(VIP_BUNDLES, "VIP bundles by status (started, finalized, rolled_back)");
    describe_counter!(REFUNDS, "Show tickets refunded");
    describe_counter!(
        REBUILD_EVENTS,
        "Archived events replayed into the ops read model (applied, skipped, unresolved)"
    );

    tracing::info!("Business metrics registered");
}

/// A booking committed with `seats` seats.
pub fn record_booking_committed(seats: u32) {
    metrics::counter!(BOOKINGS, "outcome" => "booked").increment(1);
    metrics::counter!(SEATS_BOOKED).increment(u64::from(seats));
}

/// A booking that already committed was delivered again.
pub fn record_booking_redelivered() {
    metrics::counter!(BOOKINGS, "outcome" => "redelivered").increment(1);
}

/// A booking was rejected for lack of seats.
pub fn record_booking_sold_out() {
    metrics::counter!(BOOKINGS, "outcome" => "sold_out").increment(1);
}

/// A VIP bundle purchase was accepted.
pub fn record_bundle_started() {
    metrics::counter!(VIP_BUNDLES, "status" => "started").increment(1);
}

/// Every leg of a VIP bundle is booked.
pub fn record_bundle_finalized() {
    metrics::counter!(VIP_BUNDLES, "status" => "finalized").increment(1);
}

/// A VIP bundle was compensated and marked failed.
pub fn record_bundle_rolled_back() {
    metrics::counter!(VIP_BUNDLES, "status" => "rolled_back").increment(1);
}

/// A show ticket was refunded.
pub fn record_ticket_refunded() {
    metrics::counter!(REFUNDS).increment(1);
}

/// Counts of a finished read model rebuild.
pub fn record_rebuild(applied: usize, skipped: usize, unresolved: usize) {
    for (result, count) in [("applied", applied), ("skipped", skipped), ("unresolved", unresolved)] {
        metrics::counter!(REBUILD_EVENTS, "result" => result)
            .increment(u64::try_from(count).unwrap_or(u64::MAX));
    }
    tracing::debug!(applied, skipped, unresolved, "Recorded rebuild metrics");
}

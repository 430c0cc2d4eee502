//! Operation Registry — the closed set of operation kinds this scheduler
//! knows about, and the pure lookup tables (priority, classification,
//! timeout) keyed by kind.
//!
//! Pure data: nothing here touches the queue, the lock, or a handler.
//! Priorities and the write/sync partition are fixed at build time —
//! changing them is an ABI decision, not a runtime configuration one.

use std::time::Duration;

/// The closed set of operation kinds the core dispatches.
///
/// Adding a kind here without updating [`priority`], [`classification`] and
/// [`timeout`] is a compile error by construction: every function below
/// matches exhaustively with no wildcard arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(type_name = "operation_kind", rename_all = "kebab-case")]
pub enum OperationKind {
    SubmitOrder,
    CreateCustomer,
    UpdateCustomer,
    SendToVerona,
    EditOrder,
    DeleteOrder,
    DownloadDdtPdf,
    DownloadInvoicePdf,
    SyncOrderArticles,
    SyncCustomers,
    SyncOrders,
    SyncDdt,
    SyncInvoices,
    SyncProducts,
    SyncPrices,
}

impl OperationKind {
    pub const ALL: [OperationKind; 15] = [
        OperationKind::SubmitOrder,
        OperationKind::CreateCustomer,
        OperationKind::UpdateCustomer,
        OperationKind::SendToVerona,
        OperationKind::EditOrder,
        OperationKind::DeleteOrder,
        OperationKind::DownloadDdtPdf,
        OperationKind::DownloadInvoicePdf,
        OperationKind::SyncOrderArticles,
        OperationKind::SyncCustomers,
        OperationKind::SyncOrders,
        OperationKind::SyncDdt,
        OperationKind::SyncInvoices,
        OperationKind::SyncProducts,
        OperationKind::SyncPrices,
    ];

    /// The kebab-case name used in logs, events and the `sync-*` prefix
    /// test that drives sync-event logging (§4.3.3).
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::SubmitOrder => "submit-order",
            OperationKind::CreateCustomer => "create-customer",
            OperationKind::UpdateCustomer => "update-customer",
            OperationKind::SendToVerona => "send-to-verona",
            OperationKind::EditOrder => "edit-order",
            OperationKind::DeleteOrder => "delete-order",
            OperationKind::DownloadDdtPdf => "download-ddt-pdf",
            OperationKind::DownloadInvoicePdf => "download-invoice-pdf",
            OperationKind::SyncOrderArticles => "sync-order-articles",
            OperationKind::SyncCustomers => "sync-customers",
            OperationKind::SyncOrders => "sync-orders",
            OperationKind::SyncDdt => "sync-ddt",
            OperationKind::SyncInvoices => "sync-invoices",
            OperationKind::SyncProducts => "sync-products",
            OperationKind::SyncPrices => "sync-prices",
        }
    }

    /// Handlers whose external side effect is irreversible and therefore
    /// MUST follow the check/save/clear bot-result protocol (§4.3.5).
    pub fn requires_bot_result_protocol(&self) -> bool {
        matches!(
            self,
            OperationKind::SubmitOrder
                | OperationKind::CreateCustomer
                | OperationKind::UpdateCustomer
                | OperationKind::SendToVerona
                | OperationKind::DeleteOrder
        )
    }

    /// Whether this kind begins with `sync-` for the purposes of §4.3.3's
    /// persistent sync-event logging.
    pub fn is_sync_event_logged(&self) -> bool {
        self.as_str().starts_with("sync-")
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three preemption/retry-governing classifications derivable from
/// kind (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationClass {
    Write,
    PerOrderRead,
    ScheduledSync,
}

/// `priority(kind) -> int`. Lower is more urgent. Writes occupy 1-6,
/// per-order reads 7-8, per-order sync 9, bulk syncs 10-15.
pub fn priority(kind: OperationKind) -> i16 {
    match kind {
        OperationKind::SubmitOrder => 1,
        OperationKind::CreateCustomer => 2,
        OperationKind::UpdateCustomer => 3,
        OperationKind::SendToVerona => 4,
        OperationKind::EditOrder => 5,
        OperationKind::DeleteOrder => 6,
        OperationKind::DownloadDdtPdf => 7,
        OperationKind::DownloadInvoicePdf => 8,
        OperationKind::SyncOrderArticles => 9,
        OperationKind::SyncCustomers => 10,
        OperationKind::SyncOrders => 11,
        OperationKind::SyncDdt => 12,
        OperationKind::SyncInvoices => 13,
        OperationKind::SyncProducts => 14,
        OperationKind::SyncPrices => 15,
    }
}

/// The classification governing preemption and retry policy (§3, §4.1).
pub fn classification(kind: OperationKind) -> OperationClass {
    match kind {
        OperationKind::SubmitOrder
        | OperationKind::CreateCustomer
        | OperationKind::UpdateCustomer
        | OperationKind::SendToVerona
        | OperationKind::EditOrder
        | OperationKind::DeleteOrder => OperationClass::Write,

        OperationKind::DownloadDdtPdf
        | OperationKind::DownloadInvoicePdf
        | OperationKind::SyncOrderArticles => OperationClass::PerOrderRead,

        OperationKind::SyncCustomers
        | OperationKind::SyncOrders
        | OperationKind::SyncDdt
        | OperationKind::SyncInvoices
        | OperationKind::SyncProducts
        | OperationKind::SyncPrices => OperationClass::ScheduledSync,
    }
}

/// `isWrite(kind) -> bool`.
pub fn is_write(kind: OperationKind) -> bool {
    classification(kind) == OperationClass::Write
}

/// `isScheduledSync(kind) -> bool`. Bulk syncs only — per-order sync
/// (`sync-order-articles`) is deliberately *not* scheduled-sync for
/// preemption purposes (§4.1, and §9.1 open question 3).
pub fn is_scheduled_sync(kind: OperationKind) -> bool {
    classification(kind) == OperationClass::ScheduledSync
}

/// `timeout(kind) -> duration`. 60s to 15min depending on kind.
pub fn timeout(kind: OperationKind) -> Duration {
    match kind {
        OperationKind::SubmitOrder => Duration::from_secs(120),
        OperationKind::CreateCustomer => Duration::from_secs(60),
        OperationKind::UpdateCustomer => Duration::from_secs(60),
        OperationKind::SendToVerona => Duration::from_secs(180),
        OperationKind::EditOrder => Duration::from_secs(120),
        OperationKind::DeleteOrder => Duration::from_secs(60),
        OperationKind::DownloadDdtPdf => Duration::from_secs(90),
        OperationKind::DownloadInvoicePdf => Duration::from_secs(90),
        OperationKind::SyncOrderArticles => Duration::from_secs(120),
        OperationKind::SyncCustomers => Duration::from_secs(600),
        OperationKind::SyncOrders => Duration::from_secs(900),
        OperationKind::SyncDdt => Duration::from_secs(600),
        OperationKind::SyncInvoices => Duration::from_secs(600),
        OperationKind::SyncProducts => Duration::from_secs(900),
        OperationKind::SyncPrices => Duration::from_secs(300),
    }
}

/// Retry policy derived from kind (§4.4): scheduled syncs retry up to 3x
/// with exponential backoff from 30s; PDF downloads retry up to 2x with a
/// fixed 5s delay; every other kind does not retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: RetryBackoff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryBackoff {
    None,
    Fixed(Duration),
    ExponentialFrom(Duration),
}

pub fn retry_policy(kind: OperationKind) -> RetryPolicy {
    match kind {
        OperationKind::DownloadDdtPdf | OperationKind::DownloadInvoicePdf => RetryPolicy {
            max_attempts: 2,
            backoff: RetryBackoff::Fixed(Duration::from_secs(5)),
        },
        _ if is_scheduled_sync(kind) => RetryPolicy {
            max_attempts: 3,
            backoff: RetryBackoff::ExponentialFrom(Duration::from_secs(30)),
        },
        _ => RetryPolicy {
            max_attempts: 0,
            backoff: RetryBackoff::None,
        },
    }
}

/// Whether an execution failure on `attempt_number` (the retry attempt
/// about to be scheduled, 1-based) should be re-enqueued, and with what
/// delay (§4.4, §7). Returns `None` once `kind`'s `max_attempts` is
/// exhausted, or immediately for kinds that don't retry at all.
///
/// `ExponentialFrom(base)` doubles per attempt with no cap of its own —
/// the policy's `max_attempts` is what bounds it, unlike the admission
/// backoff in [`crate::job::backoff_delay`] which caps at 30s regardless
/// of attempt count.
pub fn next_retry_delay(kind: OperationKind, attempt_number: u32) -> Option<Duration> {
    let policy = retry_policy(kind);
    if attempt_number == 0 || attempt_number > policy.max_attempts {
        return None;
    }
    match policy.backoff {
        RetryBackoff::None => None,
        RetryBackoff::Fixed(delay) => Some(delay),
        RetryBackoff::ExponentialFrom(base) => {
            let exponent = attempt_number - 1;
            Some(base.saturating_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_and_scheduled_sync_partitions_are_disjoint() {
        for kind in OperationKind::ALL {
            assert!(
                !(is_write(kind) && is_scheduled_sync(kind)),
                "{kind} is both write and scheduled-sync"
            );
        }
    }

    #[test]
    fn per_order_reads_are_never_scheduled_sync() {
        for kind in OperationKind::ALL {
            if classification(kind) == OperationClass::PerOrderRead {
                assert!(!is_scheduled_sync(kind));
            }
        }
    }

    #[test]
    fn priorities_fall_in_the_documented_bands() {
        for kind in OperationKind::ALL {
            let p = priority(kind);
            match classification(kind) {
                OperationClass::Write => assert!((1..=6).contains(&p)),
                OperationClass::PerOrderRead => assert!((7..=9).contains(&p)),
                OperationClass::ScheduledSync => assert!((10..=15).contains(&p)),
            }
        }
    }

    #[test]
    fn sync_kinds_are_flagged_for_sync_event_logging() {
        assert!(OperationKind::SyncCustomers.is_sync_event_logged());
        assert!(!OperationKind::SubmitOrder.is_sync_event_logged());
    }

    #[test]
    fn scheduled_syncs_retry_three_times_with_exponential_backoff() {
        let policy = retry_policy(OperationKind::SyncCustomers);
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff, RetryBackoff::ExponentialFrom(Duration::from_secs(30)));
    }

    #[test]
    fn pdf_downloads_retry_twice_with_fixed_delay() {
        let policy = retry_policy(OperationKind::DownloadDdtPdf);
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.backoff, RetryBackoff::Fixed(Duration::from_secs(5)));
    }

    #[test]
    fn writes_do_not_retry() {
        let policy = retry_policy(OperationKind::SubmitOrder);
        assert_eq!(policy.max_attempts, 0);
        assert_eq!(policy.backoff, RetryBackoff::None);
    }

    #[test]
    fn writes_never_get_a_retry_delay() {
        assert_eq!(next_retry_delay(OperationKind::SubmitOrder, 1), None);
    }

    #[test]
    fn pdf_downloads_retry_twice_then_stop() {
        assert_eq!(
            next_retry_delay(OperationKind::DownloadDdtPdf, 1),
            Some(Duration::from_secs(5))
        );
        assert_eq!(
            next_retry_delay(OperationKind::DownloadDdtPdf, 2),
            Some(Duration::from_secs(5))
        );
        assert_eq!(next_retry_delay(OperationKind::DownloadDdtPdf, 3), None);
    }

    #[test]
    fn scheduled_syncs_retry_three_times_doubling_from_thirty_seconds() {
        assert_eq!(
            next_retry_delay(OperationKind::SyncCustomers, 1),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            next_retry_delay(OperationKind::SyncCustomers, 2),
            Some(Duration::from_secs(60))
        );
        assert_eq!(
            next_retry_delay(OperationKind::SyncCustomers, 3),
            Some(Duration::from_secs(120))
        );
        assert_eq!(next_retry_delay(OperationKind::SyncCustomers, 4), None);
    }

    #[test]
    fn attempt_zero_never_retries() {
        assert_eq!(next_retry_delay(OperationKind::SyncCustomers, 0), None);
    }
}

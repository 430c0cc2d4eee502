//! Demo operation handlers (§6.4) — illustrative implementations of
//! the fifteen registered operation kinds. None of these talk to a real
//! ERP; they exist to exercise the processor's admission, timeout,
//! preemption and bot-result recovery paths end-to-end.

use std::sync::Arc;
use std::time::Duration;

use scheduler_core::registry::{HandlerArgs, HandlerRegistry};
use scheduler_core::store::{check_bot_result, clear_bot_result, save_bot_result, PersistentStore};
use scheduler_core::OperationKind;
use serde_json::{json, Value};
use tracing::info;

/// Registers a demo handler for every [`OperationKind`], so
/// [`HandlerRegistry::validate_complete`] passes at boot (§9 redesign
/// flag "missing kinds are a boot-time error").
pub fn build_registry(store: Arc<dyn PersistentStore>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();

    registry.register(OperationKind::SubmitOrder, {
        let store = store.clone();
        move |args| submit_order(args, store.clone())
    });
    registry.register(OperationKind::CreateCustomer, {
        let store = store.clone();
        move |args| create_customer(args, store.clone())
    });
    registry.register(OperationKind::UpdateCustomer, {
        let store = store.clone();
        move |args| update_customer(args, store.clone())
    });
    registry.register(OperationKind::SendToVerona, {
        let store = store.clone();
        move |args| send_to_verona(args, store.clone())
    });
    registry.register(OperationKind::EditOrder, |args| edit_order(args));
    registry.register(OperationKind::DeleteOrder, {
        let store = store.clone();
        move |args| delete_order(args, store.clone())
    });
    registry.register(OperationKind::DownloadDdtPdf, |args| download_pdf(args, "ddt"));
    registry.register(OperationKind::DownloadInvoicePdf, |args| download_pdf(args, "invoice"));
    registry.register(OperationKind::SyncOrderArticles, |args| sync_order_articles(args));
    registry.register(OperationKind::SyncCustomers, |args| scheduled_sync(args, "customers"));
    registry.register(OperationKind::SyncOrders, |args| scheduled_sync(args, "orders"));
    registry.register(OperationKind::SyncDdt, |args| scheduled_sync(args, "ddt"));
    registry.register(OperationKind::SyncInvoices, |args| scheduled_sync(args, "invoices"));
    registry.register(OperationKind::SyncProducts, |args| scheduled_sync(args, "products"));
    registry.register(OperationKind::SyncPrices, |args| scheduled_sync(args, "prices"));

    registry
}

/// `submit-order` follows the check/save/clear bot-result protocol
/// (§4.3.5): the bot call (placing the order on the ERP) is saved
/// before the business-table write, so a crash between the two is
/// recoverable without resubmitting to the ERP.
async fn submit_order(args: HandlerArgs, store: Arc<dyn PersistentStore>) -> anyhow::Result<Value> {
    let order_key = args
        .data
        .get("orderId")
        .and_then(Value::as_str)
        .unwrap_or("unknown-order")
        .to_string();

    args.progress.report(10, Some("Creazione ordine su Archibald".into())).await;

    let erp_result = match check_bot_result(&*store, args.user_id, OperationKind::SubmitOrder, &order_key).await? {
        Some(saved) => {
            info!(order_key, "bot result already saved, skipping ERP submission");
            saved
        }
        None => {
            if args.signal.is_cancelled() {
                return Ok(json!({"success": false, "error": "cancelled before ERP submission"}));
            }
            args.progress.report(50, Some("Invio a Archibald".into())).await;
            let result = json!({"archibaldOrderId": format!("ARC-{order_key}")});
            save_bot_result(&*store, args.user_id, OperationKind::SubmitOrder, &order_key, result.clone()).await?;
            result
        }
    };

    args.progress.report(90, Some("Aggiornamento database locale".into())).await;
    // Business-table write would happen here, using `erp_result`.
    clear_bot_result(&*store, args.user_id, OperationKind::SubmitOrder, &order_key).await?;

    Ok(json!({"success": true, "orderId": order_key, "archibald": erp_result}))
}

async fn create_customer(args: HandlerArgs, store: Arc<dyn PersistentStore>) -> anyhow::Result<Value> {
    let name = args
        .data
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("unnamed-customer")
        .to_string();

    args.progress.report(20, Some("Creazione cliente".into())).await;

    let profile = match check_bot_result(&*store, args.user_id, OperationKind::CreateCustomer, &name).await? {
        Some(saved) => saved,
        None => {
            let result = json!({"customerProfile": format!("CUST-{name}")});
            save_bot_result(&*store, args.user_id, OperationKind::CreateCustomer, &name, result.clone()).await?;
            result
        }
    };

    clear_bot_result(&*store, args.user_id, OperationKind::CreateCustomer, &name).await?;
    Ok(json!({"success": true, "customer": profile}))
}

async fn update_customer(args: HandlerArgs, store: Arc<dyn PersistentStore>) -> anyhow::Result<Value> {
    let key = args
        .data
        .get("customerId")
        .and_then(Value::as_str)
        .unwrap_or("unknown-customer")
        .to_string();

    let updated = match check_bot_result(&*store, args.user_id, OperationKind::UpdateCustomer, &key).await? {
        Some(saved) => saved,
        None => {
            let result = json!({"updated": true});
            save_bot_result(&*store, args.user_id, OperationKind::UpdateCustomer, &key, result.clone()).await?;
            result
        }
    };

    clear_bot_result(&*store, args.user_id, OperationKind::UpdateCustomer, &key).await?;
    Ok(json!({"success": true, "customerId": key, "result": updated}))
}

async fn send_to_verona(args: HandlerArgs, store: Arc<dyn PersistentStore>) -> anyhow::Result<Value> {
    let key = args
        .data
        .get("orderId")
        .and_then(Value::as_str)
        .unwrap_or("unknown-order")
        .to_string();

    let sent = match check_bot_result(&*store, args.user_id, OperationKind::SendToVerona, &key).await? {
        Some(saved) => saved,
        None => {
            let result = json!({"veronaShipmentId": format!("VR-{key}")});
            save_bot_result(&*store, args.user_id, OperationKind::SendToVerona, &key, result.clone()).await?;
            result
        }
    };

    clear_bot_result(&*store, args.user_id, OperationKind::SendToVerona, &key).await?;
    Ok(json!({"success": true, "orderId": key, "verona": sent}))
}

/// `edit-order` is a write but not in the bot-result protocol list
/// (§4.3.5): editing is assumed idempotent-by-construction on the ERP
/// side in this demo.
async fn edit_order(args: HandlerArgs) -> anyhow::Result<Value> {
    args.progress.report(50, Some("Modifica ordine".into())).await;
    Ok(json!({"success": true, "orderId": args.data.get("orderId").cloned().unwrap_or(Value::Null)}))
}

async fn delete_order(args: HandlerArgs, store: Arc<dyn PersistentStore>) -> anyhow::Result<Value> {
    let key = args
        .data
        .get("orderId")
        .and_then(Value::as_str)
        .unwrap_or("unknown-order")
        .to_string();

    let deleted = match check_bot_result(&*store, args.user_id, OperationKind::DeleteOrder, &key).await? {
        Some(saved) => saved,
        None => {
            let result = json!({"deleted": true});
            save_bot_result(&*store, args.user_id, OperationKind::DeleteOrder, &key, result.clone()).await?;
            result
        }
    };

    clear_bot_result(&*store, args.user_id, OperationKind::DeleteOrder, &key).await?;
    Ok(json!({"success": true, "orderId": key, "result": deleted}))
}

async fn download_pdf(args: HandlerArgs, label: &'static str) -> anyhow::Result<Value> {
    args.progress.report(30, Some(format!("Download {label} PDF"))).await;
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(200)) => {}
        _ = args.signal.cancelled() => {
            return Ok(json!({"success": false, "error": format!("{label} download cancelled")}));
        }
    }
    args.emit.emit("PDF_READY", json!({"label": label})).await;
    Ok(json!({"success": true, "pdfBytes": 1024, "label": label}))
}

async fn sync_order_articles(args: HandlerArgs) -> anyhow::Result<Value> {
    args.progress.report(50, Some("Sincronizzazione articoli ordine".into())).await;
    Ok(json!({"success": true, "articlesSynced": 0}))
}

/// Bulk scheduled syncs are the only kind preemptable by a write on the
/// same agent (§4.2). This handler polls the combined signal in a
/// loop so preemption actually interrupts it instead of running to
/// completion regardless.
async fn scheduled_sync(args: HandlerArgs, label: &'static str) -> anyhow::Result<Value> {
    const STEPS: u8 = 10;
    for step in 0..STEPS {
        if args.signal.is_cancelled() {
            return Ok(json!({"success": false, "error": format!("{label} sync aborted")}));
        }
        let progress = ((step + 1) as u16 * 100 / STEPS as u16) as u8;
        args.progress.report(progress, Some(format!("Sincronizzazione {label}"))).await;
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(300)) => {}
            _ = args.signal.cancelled() => {
                return Ok(json!({"success": false, "error": format!("{label} sync aborted")}));
            }
        }
    }
    Ok(json!({"success": true, "synced": label}))
}

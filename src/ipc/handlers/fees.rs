use super::setup;
use crate::backup::sha256_hex;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, now_ts, optional_str, parse_iso_date, required_f64, required_str, student_exists,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

// Currency comparisons tolerate half a cent of float drift.
const BALANCE_EPSILON: f64 = 0.005;

const RECEIPT_SEQ_KEY: &str = "fees.receiptSeq";

fn paid_total(conn: &Connection, fee_id: &str) -> Result<f64, rusqlite::Error> {
    conn.query_row(
        "SELECT COALESCE(SUM(amount), 0) FROM fee_payments WHERE fee_item_id = ?",
        [fee_id],
        |r| r.get(0),
    )
}

fn receipt_checksum(receipt_no: &str, fee_id: &str, amount: f64, paid_at: &str) -> String {
    sha256_hex(format!("{}|{}|{}|{}", receipt_no, fee_id, amount, paid_at).as_bytes())
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let student_id = optional_str(req, "studentId");
    let status = optional_str(req, "status");
    if let Some(s) = status.as_deref() {
        if s != "pending" && s != "paid" && s != "waived" {
            return err(
                &req.id,
                "bad_params",
                "status must be pending, paid, or waived",
                None,
            );
        }
    }

    let mut sql = String::from(
        "SELECT f.id, f.student_id, s.last_name, s.first_name, f.title, f.amount,
                f.due_date, f.status, f.created_at, f.updated_at,
                COALESCE((SELECT SUM(p.amount) FROM fee_payments p WHERE p.fee_item_id = f.id), 0)
         FROM fee_items f
         JOIN students s ON s.id = f.student_id",
    );
    let mut where_parts: Vec<&str> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();
    if let Some(sid) = student_id {
        where_parts.push("f.student_id = ?");
        bind_values.push(Value::Text(sid));
    }
    if let Some(st) = status {
        where_parts.push("f.status = ?");
        bind_values.push(Value::Text(st));
    }
    if !where_parts.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&where_parts.join(" AND "));
    }
    sql.push_str(" ORDER BY f.created_at, f.title");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(params_from_iter(bind_values), |r| {
            let id: String = r.get(0)?;
            let student_id: String = r.get(1)?;
            let last_name: String = r.get(2)?;
            let first_name: String = r.get(3)?;
            let title: String = r.get(4)?;
            let amount: f64 = r.get(5)?;
            let due_date: Option<String> = r.get(6)?;
            let status: String = r.get(7)?;
            let created_at: Option<String> = r.get(8)?;
            let updated_at: Option<String> = r.get(9)?;
            let paid: f64 = r.get(10)?;
            Ok(json!({
                "id": id,
                "studentId": student_id,
                "studentName": format!("{}, {}", last_name, first_name),
                "title": title,
                "amount": amount,
                "dueDate": due_date,
                "status": status,
                "paidTotal": paid,
                "balance": amount - paid,
                "createdAt": created_at,
                "updatedAt": updated_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(fees) => ok(&req.id, json!({ "fees": fees })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let title = match required_str(req, "title") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let amount = match required_f64(req, "amount") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if !amount.is_finite() || amount <= 0.0 {
        return err(
            &req.id,
            "validation_failed",
            "amount must be greater than 0",
            Some(json!({ "amount": amount })),
        );
    }
    let due_date = match optional_str(req, "dueDate") {
        Some(raw) => match parse_iso_date(&raw) {
            Ok(d) => Some(d),
            Err(msg) => return err(&req.id, "bad_params", msg, None),
        },
        None => None,
    };

    match student_exists(conn, &student_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let fee_id = Uuid::new_v4().to_string();
    let ts = now_ts();
    if let Err(e) = conn.execute(
        "INSERT INTO fee_items(id, student_id, title, amount, due_date, status, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, 'pending', ?, ?)",
        (&fee_id, &student_id, &title, amount, &due_date, &ts, &ts),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "fee_items" })),
        );
    }

    ok(&req.id, json!({ "feeId": fee_id }))
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let fee_id = match required_str(req, "feeId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing/invalid patch", None);
    };

    let exists = match conn
        .query_row("SELECT 1 FROM fee_items WHERE id = ? LIMIT 1", [&fee_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
    {
        Ok(v) => v.is_some(),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if !exists {
        return err(&req.id, "not_found", "fee item not found", None);
    }

    let mut set_parts: Vec<String> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();

    if let Some(v) = patch.get("title") {
        let Some(s) = v.as_str() else {
            return err(&req.id, "bad_params", "patch.title must be a string", None);
        };
        let s = s.trim().to_string();
        if s.is_empty() {
            return err(&req.id, "bad_params", "title must not be empty", None);
        }
        set_parts.push("title = ?".into());
        bind_values.push(Value::Text(s));
    }
    if let Some(v) = patch.get("amount") {
        let Some(n) = v.as_f64() else {
            return err(&req.id, "bad_params", "patch.amount must be a number", None);
        };
        if !n.is_finite() || n <= 0.0 {
            return err(
                &req.id,
                "validation_failed",
                "amount must be greater than 0",
                Some(json!({ "amount": n })),
            );
        }
        let paid = match paid_total(conn, &fee_id) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if n + BALANCE_EPSILON < paid {
            return err(
                &req.id,
                "validation_failed",
                "amount cannot drop below the amount already paid",
                Some(json!({ "paidTotal": paid })),
            );
        }
        set_parts.push("amount = ?".into());
        bind_values.push(Value::Real(n));
    }
    if let Some(v) = patch.get("dueDate") {
        if v.is_null() {
            set_parts.push("due_date = ?".into());
            bind_values.push(Value::Null);
        } else if let Some(s) = v.as_str() {
            match parse_iso_date(s) {
                Ok(d) => {
                    set_parts.push("due_date = ?".into());
                    bind_values.push(Value::Text(d));
                }
                Err(msg) => return err(&req.id, "bad_params", msg, None),
            }
        } else {
            return err(
                &req.id,
                "bad_params",
                "patch.dueDate must be a string or null",
                None,
            );
        }
    }
    if let Some(v) = patch.get("status") {
        let Some(s) = v.as_str() else {
            return err(&req.id, "bad_params", "patch.status must be a string", None);
        };
        if s != "pending" && s != "paid" && s != "waived" {
            return err(
                &req.id,
                "bad_params",
                "status must be pending, paid, or waived",
                None,
            );
        }
        set_parts.push("status = ?".into());
        bind_values.push(Value::Text(s.to_string()));
    }

    if set_parts.is_empty() {
        return err(
            &req.id,
            "bad_params",
            "patch must include at least one field",
            None,
        );
    }

    set_parts.push("updated_at = ?".into());
    bind_values.push(Value::Text(now_ts()));

    let sql = format!("UPDATE fee_items SET {} WHERE id = ?", set_parts.join(", "));
    bind_values.push(Value::Text(fee_id));

    if let Err(e) = conn.execute(&sql, params_from_iter(bind_values)) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "fee_items" })),
        );
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_record_payment(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let fee_id = match required_str(req, "feeId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let amount = match required_f64(req, "amount") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let method = match required_str(req, "method") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let reference = optional_str(req, "reference");

    if !amount.is_finite() || amount <= 0.0 {
        return err(
            &req.id,
            "validation_failed",
            "amount must be greater than 0",
            Some(json!({ "amount": amount })),
        );
    }

    let fee_row: Option<(f64, String)> = match conn
        .query_row(
            "SELECT amount, status FROM fee_items WHERE id = ?",
            [&fee_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((fee_amount, fee_status)) = fee_row else {
        return err(&req.id, "not_found", "fee item not found", None);
    };
    if fee_status == "waived" {
        return err(
            &req.id,
            "conflict",
            "fee item is waived and does not accept payments",
            None,
        );
    }

    let paid = match paid_total(conn, &fee_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let balance = fee_amount - paid;
    if amount > balance + BALANCE_EPSILON {
        return err(
            &req.id,
            "validation_failed",
            "payment exceeds the outstanding balance",
            Some(json!({ "balance": balance })),
        );
    }
    let fees_cfg = setup::fees_config(conn);
    if !fees_cfg.allow_partial_payments && (balance - amount).abs() > BALANCE_EPSILON {
        return err(
            &req.id,
            "validation_failed",
            "partial payments are disabled for this workspace",
            Some(json!({ "balance": balance })),
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let next_seq = match db::settings_get_json(&tx, RECEIPT_SEQ_KEY) {
        Ok(Some(v)) => v.get("next").and_then(|n| n.as_i64()).unwrap_or(1),
        Ok(None) => 1,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let receipt_no = format!("{}-{:06}", fees_cfg.receipt_prefix, next_seq);
    if let Err(e) = db::settings_set_json(&tx, RECEIPT_SEQ_KEY, &json!({ "next": next_seq + 1 })) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    let payment_id = Uuid::new_v4().to_string();
    let paid_at = now_ts();
    let checksum = receipt_checksum(&receipt_no, &fee_id, amount, &paid_at);
    if let Err(e) = tx.execute(
        "INSERT INTO fee_payments(id, fee_item_id, amount, method, reference, receipt_no, checksum, paid_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &payment_id,
            &fee_id,
            amount,
            &method,
            &reference,
            &receipt_no,
            &checksum,
            &paid_at,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "fee_payments" })),
        );
    }

    let new_balance = balance - amount;
    let status = if new_balance.abs() <= BALANCE_EPSILON {
        "paid"
    } else {
        "pending"
    };
    if let Err(e) = tx.execute(
        "UPDATE fee_items SET status = ?, updated_at = ? WHERE id = ?",
        (status, now_ts(), &fee_id),
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "fee_items" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    info!(fee = %fee_id, receipt = %receipt_no, amount, "payment recorded");
    ok(
        &req.id,
        json!({
            "paymentId": payment_id,
            "receiptNo": receipt_no,
            "checksum": checksum,
            "paidAt": paid_at,
            "balance": new_balance,
            "status": status
        }),
    )
}

fn handle_verify_receipt(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let receipt_no = match required_str(req, "receiptNo") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let row = conn
        .query_row(
            "SELECT id, fee_item_id, amount, method, reference, checksum, paid_at
             FROM fee_payments
             WHERE receipt_no = ?",
            [&receipt_no],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, f64>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, Option<String>>(4)?,
                    r.get::<_, String>(5)?,
                    r.get::<_, Option<String>>(6)?,
                ))
            },
        )
        .optional();
    let (payment_id, fee_id, amount, method, reference, stored_checksum, paid_at) = match row {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "receipt not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let expected = receipt_checksum(
        &receipt_no,
        &fee_id,
        amount,
        paid_at.as_deref().unwrap_or(""),
    );
    let valid = expected == stored_checksum;

    ok(
        &req.id,
        json!({
            "valid": valid,
            "payment": {
                "id": payment_id,
                "feeId": fee_id,
                "amount": amount,
                "method": method,
                "reference": reference,
                "receiptNo": receipt_no,
                "paidAt": paid_at
            }
        }),
    )
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let fee_id = match required_str(req, "feeId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let payment_count: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM fee_payments WHERE fee_item_id = ?",
        [&fee_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if payment_count > 0 {
        return err(
            &req.id,
            "conflict",
            "fee item has recorded payments and cannot be deleted",
            Some(json!({ "payments": payment_count })),
        );
    }

    let changed = match conn.execute("DELETE FROM fee_items WHERE id = ?", [&fee_id]) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "fee_items" })),
            )
        }
    };
    if changed == 0 {
        return err(&req.id, "not_found", "fee item not found", None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "fees.list" => Some(handle_list(state, req)),
        "fees.create" => Some(handle_create(state, req)),
        "fees.update" => Some(handle_update(state, req)),
        "fees.recordPayment" => Some(handle_record_payment(state, req)),
        "fees.verifyReceipt" => Some(handle_verify_receipt(state, req)),
        "fees.delete" => Some(handle_delete(state, req)),
        _ => None,
    }
}

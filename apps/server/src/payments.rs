use async_trait::async_trait;

/// Outcome of a payment verification poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentState {
    Paid,
    Pending,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct Invoice {
    pub invoice_ref: String,
    pub external_url: String,
}

/// Minimal payment-provider port consumed by the state machine and the
/// reconciler. Adapter failures are infrastructure errors; the caller maps
/// them onto the booking lifecycle.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_invoice(
        &self,
        booking_id: i64,
        amount_minor: i64,
        currency: &str,
    ) -> anyhow::Result<Invoice>;

    async fn verify_payment(&self, invoice_ref: &str) -> anyhow::Result<PaymentState>;
}

// ── YooKassa adapter ──

pub struct YooKassaProvider {
    http: reqwest::Client,
    shop_id: String,
    secret_key: String,
    return_url: String,
}

impl YooKassaProvider {
    pub fn new(shop_id: String, secret_key: String, return_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            shop_id,
            secret_key,
            return_url,
        }
    }
}

#[async_trait]
impl PaymentProvider for YooKassaProvider {
    async fn create_invoice(
        &self,
        booking_id: i64,
        amount_minor: i64,
        currency: &str,
    ) -> anyhow::Result<Invoice> {
        let idempotence_key = format!(
            "booking-{}-{}",
            booking_id,
            chrono::Utc::now().timestamp_millis()
        );

        let body = serde_json::json!({
            "amount": {
                "value": format_minor(amount_minor),
                "currency": currency
            },
            "capture": true,
            "confirmation": {
                "type": "redirect",
                "return_url": self.return_url
            },
            "description": format!("Booking #{booking_id}"),
            "metadata": {
                "booking_id": booking_id.to_string()
            }
        });

        let resp = self
            .http
            .post("https://api.yookassa.ru/v3/payments")
            .basic_auth(&self.shop_id, Some(&self.secret_key))
            .header("Idempotence-Key", &idempotence_key)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            tracing::error!(booking_id, %status, %text, "invoice creation failed");
            anyhow::bail!("payment provider error: {status}");
        }

        let json: serde_json::Value = resp.json().await?;
        let invoice_ref = json["id"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing payment id in provider response"))?
            .to_string();
        let external_url = json["confirmation"]["confirmation_url"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing confirmation URL in provider response"))?
            .to_string();

        tracing::info!(booking_id, invoice_ref = %invoice_ref, "invoice created");
        Ok(Invoice {
            invoice_ref,
            external_url,
        })
    }

    async fn verify_payment(&self, invoice_ref: &str) -> anyhow::Result<PaymentState> {
        let url = format!("https://api.yookassa.ru/v3/payments/{invoice_ref}");
        let resp = self
            .http
            .get(&url)
            .basic_auth(&self.shop_id, Some(&self.secret_key))
            .send()
            .await?;

        if !resp.status().is_success() {
            anyhow::bail!("payment provider error: {}", resp.status());
        }

        let json: serde_json::Value = resp.json().await?;
        let status = json["status"].as_str().unwrap_or("");
        Ok(map_provider_status(status))
    }
}

/// YooKassa status → port state. Unknown statuses are treated as failed so
/// the reconciler releases the slot instead of holding it forever.
fn map_provider_status(status: &str) -> PaymentState {
    match status {
        "succeeded" => PaymentState::Paid,
        "pending" | "waiting_for_capture" => PaymentState::Pending,
        "canceled" => PaymentState::Cancelled,
        _ => PaymentState::Failed,
    }
}

/// Minor units → provider decimal string ("12345" → "123.45").
fn format_minor(amount_minor: i64) -> String {
    format!("{}.{:02}", amount_minor / 100, amount_minor % 100)
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_minor() {
        assert_eq!(format_minor(0), "0.00");
        assert_eq!(format_minor(5), "0.05");
        assert_eq!(format_minor(100), "1.00");
        assert_eq!(format_minor(123_45), "123.45");
        assert_eq!(format_minor(80_000), "800.00");
    }

    #[test]
    fn test_map_provider_status() {
        assert_eq!(map_provider_status("succeeded"), PaymentState::Paid);
        assert_eq!(map_provider_status("pending"), PaymentState::Pending);
        assert_eq!(map_provider_status("waiting_for_capture"), PaymentState::Pending);
        assert_eq!(map_provider_status("canceled"), PaymentState::Cancelled);
        assert_eq!(map_provider_status("weird"), PaymentState::Failed);
        assert_eq!(map_provider_status(""), PaymentState::Failed);
    }
}

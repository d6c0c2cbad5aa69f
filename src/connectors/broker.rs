// src/connectors/broker.rs
use crate::connectors::traits::BrokerClient;
use crate::error::BrokerError;
use crate::types::{CloseResult, OrderResult, Side};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;
use tracing::info;

type HmacSha256 = Hmac<Sha256>;

/// REST adapter for the exchange. Requests are authenticated by signing the
/// query string (timestamp included) with HMAC-SHA256 over the API secret.
pub struct RestBroker {
    api_secret: String,
    http_client: Client,
    base_url: String,
}

impl RestBroker {
    pub fn new(base_url: String, api_secret: String, request_timeout: Duration) -> Self {
        let http_client = Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            api_secret,
            http_client,
            base_url,
        }
    }

    fn sign_and_build_query(&self, params: Vec<(&str, String)>) -> Result<String, BrokerError> {
        let mut params = params;
        let timestamp = Utc::now().timestamp_millis().to_string();
        params.push(("timestamp", timestamp));

        let query_string = serde_urlencoded::to_string(&params)
            .map_err(|e| BrokerError::BadResponse(format!("query encoding failed: {e}")))?;

        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|_| BrokerError::BadResponse("invalid API secret length".to_string()))?;
        mac.update(query_string.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        Ok(format!("{query_string}&signature={signature}"))
    }

    async fn send_signed_request<T: for<'de> Deserialize<'de>>(
        &self,
        method: Method,
        endpoint: &str,
        params: Vec<(&str, String)>,
    ) -> Result<T, BrokerError> {
        let full_query = self.sign_and_build_query(params)?;
        let url = format!("{}{}?{}", self.base_url, endpoint, full_query);

        let response = self.http_client.request(method, &url).send().await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(BrokerError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl BrokerClient for RestBroker {
    async fn get_balance(&self) -> Result<Decimal, BrokerError> {
        #[derive(Deserialize)]
        struct BalanceResponse {
            available_balance: Decimal,
        }

        let resp: BalanceResponse = self
            .send_signed_request(Method::GET, "/api/v1/wallet/futures-balance", vec![])
            .await?;
        Ok(resp.available_balance)
    }

    async fn get_mark_price(&self, symbol: &str) -> Result<Decimal, BrokerError> {
        #[derive(Deserialize)]
        struct PriceResponse {
            mark_price: Decimal,
        }

        let params = vec![("symbol", symbol.to_string())];
        let resp: PriceResponse = self
            .send_signed_request(Method::GET, "/api/v1/assets/mark-price", params)
            .await?;
        Ok(resp.mark_price)
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: Side,
        notional: Decimal,
        leverage: u32,
    ) -> Result<OrderResult, BrokerError> {
        #[derive(Deserialize)]
        struct MarketOrderResponse {
            order_id: String,
            avg_price: Decimal,
        }

        let params = vec![
            ("symbol", symbol.to_string()),
            ("side", side.as_str().to_string()),
            ("notional", notional.to_string()),
            ("leverage", leverage.to_string()),
        ];

        info!("🚀 Sending market order: {side} {notional} USDT {symbol} at {leverage}x");

        let resp: MarketOrderResponse = self
            .send_signed_request(Method::POST, "/api/v1/orders/market", params)
            .await?;

        Ok(OrderResult {
            order_id: resp.order_id,
            avg_price: resp.avg_price,
        })
    }

    async fn close_position(
        &self,
        symbol: &str,
        percent: Decimal,
    ) -> Result<CloseResult, BrokerError> {
        #[derive(Deserialize)]
        struct CloseResponse {
            realized_pnl: Decimal,
        }

        let params = vec![
            ("symbol", symbol.to_string()),
            ("percentage", percent.to_string()),
        ];

        let resp: CloseResponse = self
            .send_signed_request(Method::POST, "/api/v1/positions/close", params)
            .await?;

        Ok(CloseResult {
            realized_pnl: resp.realized_pnl,
        })
    }

    async fn update_stop_take_profit(
        &self,
        symbol: &str,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Result<(), BrokerError> {
        #[derive(Deserialize)]
        struct Ack {}

        let mut params = vec![("symbol", symbol.to_string())];
        if let Some(sl) = stop_loss {
            params.push(("stoploss_price", sl.to_string()));
        }
        if let Some(tp) = take_profit {
            params.push(("takeprofit_price", tp.to_string()));
        }

        let _: Ack = self
            .send_signed_request(Method::POST, "/api/v1/positions/risk-order", params)
            .await?;
        Ok(())
    }

    async fn update_leverage(&self, symbol: &str, leverage: u32) -> Result<(), BrokerError> {
        #[derive(Deserialize)]
        struct Ack {}

        let params = vec![
            ("symbol", symbol.to_string()),
            ("leverage", leverage.to_string()),
        ];

        let _: Ack = self
            .send_signed_request(Method::POST, "/api/v1/positions/leverage", params)
            .await?;
        Ok(())
    }
}

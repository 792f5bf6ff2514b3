// file: src/api.rs
// description: REST collaborators: authoritative auction reads, bid mutations, notification persistence

use crate::{
    config::ApiConfig,
    error::AuctionError,
    types::{
        AuctionId, AuctionSnapshot, BidEvent, BidReceipt, BidRequest, LiveStatus,
        NotificationItem, Page, PageRequest, PurchaseReceipt,
    },
};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::{debug, trace};

#[async_trait]
pub trait AuctionApi: Send + Sync {
    async fn fetch_auction(&self, auction_id: AuctionId) -> Result<AuctionSnapshot, AuctionError>;

    async fn fetch_live_status(&self, auction_id: AuctionId) -> Result<LiveStatus, AuctionError>;

    /// Bid history, newest first.
    async fn fetch_bid_history(
        &self,
        auction_id: AuctionId,
        page: PageRequest,
    ) -> Result<Page<BidEvent>, AuctionError>;

    async fn place_bid(&self, request: BidRequest) -> Result<BidReceipt, AuctionError>;

    async fn buy_now(&self, auction_id: AuctionId) -> Result<PurchaseReceipt, AuctionError>;
}

/// Server-side copy of the notification ledger.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn fetch_notifications(&self) -> Result<Vec<NotificationItem>, AuctionError>;

    async fn mark_read(&self, id: &str) -> Result<(), AuctionError>;

    async fn mark_all_read(&self) -> Result<(), AuctionError>;

    async fn clear_all(&self) -> Result<(), AuctionError>;
}

/// Success envelope.
#[derive(Debug, Deserialize)]
struct DataResponse<T> {
    data: T,
}

/// Error envelope.
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    message: String,
}

#[derive(Debug, Serialize)]
struct BuyNowRequest {
    #[serde(rename = "auctionId")]
    auction_id: AuctionId,
}

#[derive(Debug, Clone)]
pub struct RestClient {
    config: ApiConfig,
    http: reqwest::Client,
}

impl RestClient {
    pub fn new(config: ApiConfig) -> Result<Self, AuctionError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &config.auth_token
            && let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}"))
        {
            headers.insert(AUTHORIZATION, value);
        }

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .default_headers(headers)
            .user_agent(concat!("auction-live/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { config, http })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.as_str().trim_end_matches('/'), path)
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, AuctionError> {
        let status = response.status();
        let body = response.text().await?;
        if status.is_success() {
            trace!("Response {}: {}", status, body.chars().take(200).collect::<String>());
            let envelope: DataResponse<T> = serde_json::from_str(&body)?;
            return Ok(envelope.data);
        }
        let message = serde_json::from_str::<ErrorResponse>(&body)
            .map(|e| e.message)
            .unwrap_or_else(|_| status.canonical_reason().unwrap_or("request failed").to_string());
        debug!("Request failed with {}: {}", status, message);
        Err(AuctionError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn expect_ok(response: reqwest::Response) -> Result<(), AuctionError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorResponse>(&body)
            .map(|e| e.message)
            .unwrap_or_else(|_| status.to_string());
        Err(AuctionError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, AuctionError> {
        let response = self.http.get(self.url(path)).send().await?;
        Self::decode(response).await
    }
}

#[async_trait]
impl AuctionApi for RestClient {
    async fn fetch_auction(&self, auction_id: AuctionId) -> Result<AuctionSnapshot, AuctionError> {
        self.get(&format!("/api/auctions/{auction_id}")).await
    }

    async fn fetch_live_status(&self, auction_id: AuctionId) -> Result<LiveStatus, AuctionError> {
        self.get(&format!("/api/auctions/{auction_id}/status")).await
    }

    async fn fetch_bid_history(
        &self,
        auction_id: AuctionId,
        page: PageRequest,
    ) -> Result<Page<BidEvent>, AuctionError> {
        let response = self
            .http
            .get(self.url(&format!("/api/auctions/{auction_id}/bids")))
            .query(&[
                ("page", page.page.to_string()),
                ("size", page.size.to_string()),
                ("sort", PageRequest::SORT_NEWEST_FIRST.to_string()),
            ])
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn place_bid(&self, request: BidRequest) -> Result<BidReceipt, AuctionError> {
        let response = self
            .http
            .post(self.url(&format!("/api/auctions/{}/bids", request.auction_id)))
            .json(&request)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn buy_now(&self, auction_id: AuctionId) -> Result<PurchaseReceipt, AuctionError> {
        let response = self
            .http
            .post(self.url(&format!("/api/auctions/{auction_id}/buy-now")))
            .json(&BuyNowRequest { auction_id })
            .send()
            .await?;
        Self::decode(response).await
    }
}

#[async_trait]
impl NotificationStore for RestClient {
    async fn fetch_notifications(&self) -> Result<Vec<NotificationItem>, AuctionError> {
        self.get("/api/notifications").await
    }

    async fn mark_read(&self, id: &str) -> Result<(), AuctionError> {
        let response = self
            .http
            .patch(self.url(&format!("/api/notifications/{id}/read")))
            .send()
            .await?;
        Self::expect_ok(response).await
    }

    async fn mark_all_read(&self) -> Result<(), AuctionError> {
        let response = self
            .http
            .patch(self.url("/api/notifications/read-all"))
            .send()
            .await?;
        Self::expect_ok(response).await
    }

    async fn clear_all(&self) -> Result<(), AuctionError> {
        let response = self.http.delete(self.url("/api/notifications")).send().await?;
        Self::expect_ok(response).await
    }
}

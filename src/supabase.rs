use crate::http::build_client;
use crate::ports::{
    FinalListing, ListingStore, Seller, SellerDirectory, ServiceError, normalize_phone,
};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

const SELLERS_TABLE: &str = "sellers";
const LISTINGS_TABLE: &str = "listings";

#[derive(Debug, Clone)]
pub struct SupabaseClient {
    base_url: String,
    service_key: String,
    http: Client,
}

#[derive(Debug, Error)]
pub enum SupabaseError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
}

impl From<SupabaseError> for ServiceError {
    fn from(err: SupabaseError) -> Self {
        match err {
            SupabaseError::Request(msg) => ServiceError::Request(msg),
            SupabaseError::Deserialize(msg) => ServiceError::Deserialize(msg),
        }
    }
}

#[derive(Debug, Deserialize)]
struct InsertedRow {
    id: serde_json::Value,
}

impl SupabaseClient {
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("SUPABASE_URL").ok()?;
        let service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|_| std::env::var("SUPABASE_SERVICE_KEY"))
            .or_else(|_| std::env::var("SUPABASE_KEY"))
            .ok()?;
        Some(Self::new(&base_url, service_key))
    }

    pub fn new(base_url: &str, service_key: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key,
            http: build_client(),
        }
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base_url)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
    }

    async fn checked(response: Response) -> Result<Response, SupabaseError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(SupabaseError::Request(format!("HTTP {status}: {body}")))
    }

    pub async fn fetch_seller_by_email(&self, email: &str) -> Result<Option<Seller>, SupabaseError> {
        let url = format!(
            "{}?email=eq.{}&select=*&limit=1",
            self.table_url(SELLERS_TABLE),
            urlencoding::encode(&email.trim().to_lowercase())
        );
        let response = self
            .authorized(self.http.get(url))
            .send()
            .await
            .map_err(|err| SupabaseError::Request(err.to_string()))?;
        let mut rows: Vec<SellerRow> = Self::checked(response)
            .await?
            .json()
            .await
            .map_err(|err| SupabaseError::Deserialize(err.to_string()))?;
        Ok(rows.pop().map(SellerRow::into_seller))
    }

    pub async fn insert_seller(&self, email: &str, phone: &str) -> Result<Seller, SupabaseError> {
        let body = json!({ "email": email.trim().to_lowercase(), "phone": phone });
        let response = self
            .authorized(self.http.post(self.table_url(SELLERS_TABLE)))
            .header("Prefer", "return=representation")
            .json(&body)
            .send()
            .await
            .map_err(|err| SupabaseError::Request(err.to_string()))?;
        let mut rows: Vec<SellerRow> = Self::checked(response)
            .await?
            .json()
            .await
            .map_err(|err| SupabaseError::Deserialize(err.to_string()))?;
        rows.pop()
            .map(SellerRow::into_seller)
            .ok_or_else(|| SupabaseError::Deserialize("insert returned no rows".into()))
    }

    pub async fn patch_seller_phone(&self, seller_id: &str, phone: &str) -> Result<(), SupabaseError> {
        let url = format!(
            "{}?id=eq.{}",
            self.table_url(SELLERS_TABLE),
            urlencoding::encode(seller_id)
        );
        let response = self
            .authorized(self.http.patch(url))
            .json(&json!({ "phone": phone }))
            .send()
            .await
            .map_err(|err| SupabaseError::Request(err.to_string()))?;
        Self::checked(response).await?;
        Ok(())
    }

    pub async fn insert_listing(&self, listing: &FinalListing) -> Result<String, SupabaseError> {
        let response = self
            .authorized(self.http.post(self.table_url(LISTINGS_TABLE)))
            .header("Prefer", "return=representation")
            .json(listing)
            .send()
            .await
            .map_err(|err| SupabaseError::Request(err.to_string()))?;
        let mut rows: Vec<InsertedRow> = Self::checked(response)
            .await?
            .json()
            .await
            .map_err(|err| SupabaseError::Deserialize(err.to_string()))?;
        let row = rows
            .pop()
            .ok_or_else(|| SupabaseError::Deserialize("insert returned no rows".into()))?;
        Ok(match row.id {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        })
    }
}

/// Ids may come back as uuid strings or bigint numbers depending on the schema.
#[derive(Debug, Deserialize)]
struct SellerRow {
    id: serde_json::Value,
    email: String,
    #[serde(default)]
    phone: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

impl SellerRow {
    fn into_seller(self) -> Seller {
        let id = match self.id {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        Seller {
            id,
            email: self.email,
            phone: self.phone.filter(|p| !p.trim().is_empty()),
            name: self.name,
        }
    }
}

#[async_trait]
impl SellerDirectory for SupabaseClient {
    async fn find_by_email(&self, email: &str) -> Result<Option<Seller>, ServiceError> {
        Ok(self.fetch_seller_by_email(email).await?)
    }

    async fn create(&self, email: &str, phone: &str) -> Result<Seller, ServiceError> {
        let seller = self.insert_seller(email, phone).await?;
        debug!(target = "closet.supabase", seller_id = %seller.id, "seller_created");
        Ok(seller)
    }

    async fn update_phone(&self, seller_id: &str, phone: &str) -> Result<(), ServiceError> {
        Ok(self.patch_seller_phone(seller_id, phone).await?)
    }
}

#[async_trait]
impl ListingStore for SupabaseClient {
    async fn insert(&self, listing: &FinalListing) -> Result<String, ServiceError> {
        Ok(self.insert_listing(listing).await?)
    }
}

/// In-process seller directory for local runs without Supabase.
#[derive(Clone, Default)]
pub struct MemorySellerDirectory {
    sellers: Arc<Mutex<HashMap<String, Seller>>>,
}

impl MemorySellerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn add(&self, email: &str, phone: Option<&str>) -> Seller {
        let seller = Seller {
            id: Uuid::new_v4().to_string(),
            email: email.to_lowercase(),
            phone: phone.map(str::to_string),
            name: None,
        };
        self.sellers
            .lock()
            .await
            .insert(seller.email.clone(), seller.clone());
        seller
    }
}

#[async_trait]
impl SellerDirectory for MemorySellerDirectory {
    async fn find_by_email(&self, email: &str) -> Result<Option<Seller>, ServiceError> {
        let key = email.trim().to_lowercase();
        Ok(self.sellers.lock().await.get(&key).cloned())
    }

    async fn create(&self, email: &str, phone: &str) -> Result<Seller, ServiceError> {
        let key = email.trim().to_lowercase();
        let mut sellers = self.sellers.lock().await;
        let seller = sellers.entry(key.clone()).or_insert_with(|| Seller {
            id: Uuid::new_v4().to_string(),
            email: key,
            phone: Some(phone.to_string()),
            name: None,
        });
        Ok(seller.clone())
    }

    async fn update_phone(&self, seller_id: &str, phone: &str) -> Result<(), ServiceError> {
        let mut sellers = self.sellers.lock().await;
        let seller = sellers
            .values_mut()
            .find(|s| s.id == seller_id)
            .ok_or_else(|| ServiceError::Request(format!("unknown seller {seller_id}")))?;
        seller.phone = Some(phone.to_string());
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MemoryListingStore {
    rows: Arc<Mutex<Vec<(String, FinalListing)>>>,
}

impl MemoryListingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ListingStore for MemoryListingStore {
    async fn insert(&self, listing: &FinalListing) -> Result<String, ServiceError> {
        let id = Uuid::new_v4().to_string();
        self.rows.lock().await.push((id.clone(), listing.clone()));
        Ok(id)
    }
}

/// True when the directory already binds this email to a different phone.
pub fn phone_conflicts(seller: &Seller, phone: &str) -> bool {
    seller
        .phone
        .as_deref()
        .is_some_and(|on_file| normalize_phone(on_file) != normalize_phone(phone))
}

use crate::http::build_client;
use crate::listing::fields::{DraftListing, ListingField};
use crate::ports::{CatalogApi, MediaAsset, SellerMeta, ServiceError, StoredPhoto};
use crate::whatsapp::media::backoff_delay;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info};
use uuid::Uuid;

const URL_POLL_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
}

impl From<CatalogError> for ServiceError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::Request(msg) => ServiceError::Request(msg),
            CatalogError::Deserialize(msg) => ServiceError::Deserialize(msg),
        }
    }
}

#[derive(Debug, Serialize)]
struct ProductEnvelope<'a> {
    product: ProductPayload<'a>,
}

#[derive(Debug, Serialize)]
struct ProductPayload<'a> {
    title: String,
    body_html: String,
    vendor: Option<String>,
    product_type: Option<String>,
    status: &'static str,
    tags: String,
    variants: Vec<VariantPayload>,
    metafields: Vec<Metafield<'a>>,
}

#[derive(Debug, Serialize)]
struct VariantPayload {
    price: String,
    option1: Option<String>,
}

#[derive(Debug, Serialize)]
struct Metafield<'a> {
    namespace: &'static str,
    key: &'static str,
    value: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ProductResponse {
    product: ProductId,
}

#[derive(Debug, Deserialize)]
struct ProductId {
    id: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    image: ImageBody,
}

#[derive(Debug, Deserialize)]
struct ImageBody {
    id: serde_json::Value,
    #[serde(default)]
    src: Option<String>,
}

fn id_string(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

/// REST client for the product catalog. Drafts are products in `draft`
/// status; photos are attached as base64 images and their public URL may
/// appear a moment after the upload is accepted.
#[derive(Debug, Clone)]
pub struct CatalogClient {
    http: Client,
    base_url: String,
    token: String,
}

impl CatalogClient {
    pub fn from_env() -> Option<Self> {
        let base_url = crate::config::env_string("CATALOG_API_URL")?;
        let token = crate::config::env_string("CATALOG_API_TOKEN")?;
        Some(Self {
            http: build_client(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    async fn fetch_image_src(
        &self,
        product_id: &str,
        image_id: &str,
    ) -> Result<Option<String>, CatalogError> {
        let url = format!(
            "{}/products/{product_id}/images/{image_id}.json",
            self.base_url
        );
        let response = self
            .http
            .get(url)
            .header("X-Access-Token", &self.token)
            .send()
            .await
            .map_err(|err| CatalogError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(CatalogError::Request(format!("HTTP {}", response.status())));
        }
        let payload: ImageResponse = response
            .json()
            .await
            .map_err(|err| CatalogError::Deserialize(err.to_string()))?;
        Ok(payload.image.src.filter(|s| !s.is_empty()))
    }
}

fn product_payload<'a>(seller: &'a SellerMeta, fields: &DraftListing) -> ProductEnvelope<'a> {
    let details = fields.get(ListingField::Details).unwrap_or_default();
    let tags = [
        ListingField::ItemType,
        ListingField::Condition,
        ListingField::Color,
        ListingField::Material,
    ]
    .into_iter()
    .filter_map(|field| fields.get(field))
    .collect::<Vec<_>>()
    .join(", ");
    ProductEnvelope {
        product: ProductPayload {
            title: fields.title(),
            body_html: details,
            vendor: fields.get(ListingField::Designer),
            product_type: fields.get(ListingField::ItemType),
            status: "draft",
            tags,
            variants: vec![VariantPayload {
                price: fields
                    .get(ListingField::AskingPrice)
                    .unwrap_or_else(|| "0".to_string()),
                option1: fields.get(ListingField::Size),
            }],
            metafields: vec![
                Metafield {
                    namespace: "seller",
                    key: "id",
                    value: &seller.seller_id,
                    kind: "single_line_text_field",
                },
                Metafield {
                    namespace: "seller",
                    key: "email",
                    value: &seller.email,
                    kind: "single_line_text_field",
                },
            ],
        },
    }
}

#[async_trait]
impl CatalogApi for CatalogClient {
    async fn create_draft(
        &self,
        seller: &SellerMeta,
        fields: &DraftListing,
    ) -> Result<String, ServiceError> {
        let url = format!("{}/products.json", self.base_url);
        let response = self
            .http
            .post(url)
            .header("X-Access-Token", &self.token)
            .json(&product_payload(seller, fields))
            .send()
            .await
            .map_err(|err| CatalogError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(CatalogError::Request(format!("HTTP {}", response.status())).into());
        }
        let payload: ProductResponse = response
            .json()
            .await
            .map_err(|err| CatalogError::Deserialize(err.to_string()))?;
        let id = id_string(payload.product.id);
        info!(target = "closet.catalog", draft_id = %id, "catalog_draft_created");
        Ok(id)
    }

    async fn attach_photo(
        &self,
        draft_id: &str,
        asset: &MediaAsset,
    ) -> Result<StoredPhoto, ServiceError> {
        let url = format!("{}/products/{draft_id}/images.json", self.base_url);
        let body = serde_json::json!({
            "image": {
                "attachment": STANDARD.encode(&asset.bytes),
                "filename": format!("{}.{}", Uuid::new_v4().simple(), extension_for(&asset.content_type)),
            }
        });
        let response = self
            .http
            .post(url)
            .header("X-Access-Token", &self.token)
            .json(&body)
            .send()
            .await
            .map_err(|err| CatalogError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(CatalogError::Request(format!("HTTP {}", response.status())).into());
        }
        let payload: ImageResponse = response
            .json()
            .await
            .map_err(|err| CatalogError::Deserialize(err.to_string()))?;
        let asset_id = id_string(payload.image.id);
        let mut url = payload.image.src.filter(|s| !s.is_empty());

        let mut attempt = 0;
        while url.is_none() && attempt < URL_POLL_ATTEMPTS {
            attempt += 1;
            sleep(backoff_delay(attempt)).await;
            match self.fetch_image_src(draft_id, &asset_id).await {
                Ok(found) => url = found,
                Err(err) => {
                    debug!(target = "closet.catalog", asset_id = %asset_id, attempt, error = %err, "image_url_poll_failed")
                }
            }
        }
        if url.is_none() {
            debug!(target = "closet.catalog", asset_id = %asset_id, "image_url_not_published");
        }
        Ok(StoredPhoto { asset_id, url })
    }
}

fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image/png" => "png",
        "image/webp" => "webp",
        _ => "jpg",
    }
}

/// Used when no catalog credentials are configured: drafts get local ids and
/// photos are accepted without a public URL.
#[derive(Debug, Clone, Default)]
pub struct OfflineCatalog;

#[async_trait]
impl CatalogApi for OfflineCatalog {
    async fn create_draft(
        &self,
        _seller: &SellerMeta,
        _fields: &DraftListing,
    ) -> Result<String, ServiceError> {
        Ok(offline_draft_id())
    }

    async fn attach_photo(
        &self,
        _draft_id: &str,
        _asset: &MediaAsset,
    ) -> Result<StoredPhoto, ServiceError> {
        Ok(StoredPhoto {
            asset_id: Uuid::new_v4().simple().to_string(),
            url: None,
        })
    }
}

fn offline_draft_id() -> String {
    format!("DRAFT-{}", Uuid::new_v4().simple())
}

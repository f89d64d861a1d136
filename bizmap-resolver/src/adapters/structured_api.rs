//! Structured search API adapter (Yelp Fusion style)
//!
//! - Search: `GET {base}/businesses/search?term&location&limit[&categories]`
//! - Details: `GET {base}/businesses/{id}`
//!
//! Bearer-token authenticated and metered, so every request goes through the
//! adapter's [`RequestGate`].

use super::SourceAdapter;
use crate::error::{classify_status, ResolveError, ResolveResult};
use crate::throttle::RequestGate;
use crate::types::{BusinessListing, CandidateMatch, ListingDetails, RawCandidate, SourceRecord};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    businesses: Vec<ApiBusiness>,
}

#[derive(Debug, Deserialize)]
struct ApiBusiness {
    id: String,
    #[serde(default)]
    alias: Option<String>,
    #[serde(default)]
    name: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    phone: Option<String>,
    #[serde(default)]
    display_phone: Option<String>,
    #[serde(default)]
    rating: Option<f64>,
    #[serde(default)]
    review_count: Option<u32>,
    #[serde(default)]
    location: Option<ApiLocation>,
}

#[derive(Debug, Deserialize)]
struct ApiLocation {
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    state: Option<String>,
}

impl From<ApiBusiness> for BusinessListing {
    fn from(b: ApiBusiness) -> Self {
        // display_phone keeps the national format the input records use;
        // `phone` is E.164 with a country code
        let phone = b
            .display_phone
            .filter(|p| !p.trim().is_empty())
            .or(b.phone.filter(|p| !p.trim().is_empty()));
        let (city, state) = match b.location {
            Some(loc) => (loc.city, loc.state),
            None => (None, None),
        };

        Self {
            id: b.id,
            alias: b.alias,
            name: b.name,
            url: b.url,
            phone,
            city,
            state,
            rating: b.rating,
            review_count: b.review_count,
        }
    }
}

/// Construction parameters, resolved from configuration
#[derive(Debug, Clone)]
pub struct StructuredApiSettings {
    pub base_url: String,
    pub api_key: String,
    pub search_limit: u32,
    pub categories: Option<String>,
    pub timeout: Duration,
    pub user_agent: String,
}

/// Structured search endpoint adapter
pub struct StructuredApiAdapter {
    name: String,
    client: Client,
    settings: StructuredApiSettings,
    gate: RequestGate,
}

impl StructuredApiAdapter {
    pub fn new(
        name: impl Into<String>,
        settings: StructuredApiSettings,
        gate: RequestGate,
    ) -> ResolveResult<Self> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .connect_timeout(Duration::from_secs(5))
            .user_agent(settings.user_agent.clone())
            .build()
            .map_err(|e| ResolveError::Unexpected(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            name: name.into(),
            client,
            settings,
            gate,
        })
    }

    pub fn gate(&self) -> &RequestGate {
        &self.gate
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.settings.base_url.trim_end_matches('/'), path)
    }

    /// One authenticated GET, classified and decoded
    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> ResolveResult<T> {
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.settings.api_key)
            .header("Accept", "application/json")
            .query(query)
            .send()
            .await
            .map_err(|e| ResolveError::network(&self.name, e))?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(&self.name, status, &body)
                .unwrap_or_else(|| ResolveError::upstream(&self.name, status, &body)));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| ResolveError::Unexpected(format!("{}: invalid response body: {}", self.name, e)))
    }
}

#[async_trait]
impl SourceAdapter for StructuredApiAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn query(&self, target: &SourceRecord) -> ResolveResult<Vec<RawCandidate>> {
        let url = self.endpoint("businesses/search");
        let mut query = vec![
            ("term", target.name.clone()),
            ("location", format!("{}, {}", target.city, target.state)),
            ("limit", self.settings.search_limit.to_string()),
        ];
        if let Some(categories) = &self.settings.categories {
            query.push(("categories", categories.clone()));
        }

        tracing::debug!(record_id = %target.id, adapter = %self.name, "Searching structured API");

        let response: SearchResponse = self.gate.execute(|| self.get_json(&url, &query)).await?;

        Ok(response
            .businesses
            .into_iter()
            .map(|b| RawCandidate::Business(b.into()))
            .collect())
    }

    fn supports_details(&self) -> bool {
        true
    }

    async fn details(&self, listing: &CandidateMatch) -> ResolveResult<Option<ListingDetails>> {
        let url = self.endpoint(&format!("businesses/{}", listing.id));

        match self
            .gate
            .execute(|| self.get_json::<ListingDetails>(&url, &[]))
            .await
        {
            Ok(details) => Ok(Some(details)),
            Err(ResolveError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

use crate::config;
use crate::models::GeoInfo;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct IpApiResponse {
	status: String,
	#[serde(rename = "countryCode")]
	country_code: Option<String>,
	isp: Option<String>,
	message: Option<String>,
}

impl IpApiResponse {
	fn into_geo(self) -> Option<GeoInfo> {
		if self.status != "success" {
			return None;
		}

		Some(GeoInfo {
			country: self.country_code.filter(|code| !code.is_empty()),
			isp: self.isp.filter(|isp| !isp.is_empty()),
		})
	}
}

/// Country and ISP for resolved IPs through ip-api.com. Lookups never fail,
/// an unknown answer is an empty [`GeoInfo`].
#[derive(Debug, Clone)]
pub struct GeoLookup {
	client: reqwest::Client,
	endpoint: String,
	request_delay: Duration,
	cache: Arc<Mutex<HashMap<Ipv4Addr, GeoInfo>>>,
	rate_limiter: Arc<Semaphore>,
}

impl GeoLookup {
	pub fn new(config: &config::Geo) -> Self {
		Self {
			client: reqwest::Client::builder()
				.timeout(Duration::from_secs(10))
				.build()
				.unwrap_or_else(|_| reqwest::Client::new()),
			endpoint: config.endpoint.clone(),
			request_delay: Duration::from_millis(config.request_delay_ms),
			cache: Arc::new(Mutex::new(HashMap::new())),
			rate_limiter: Arc::new(Semaphore::new(config.concurrent_requests.max(1))),
		}
	}

	pub async fn lookup(&self, ip: Ipv4Addr) -> GeoInfo {
		if let Some(cached) = self.cache.lock().await.get(&ip) {
			debug!("Cache hit for IP {ip}");
			return cached.clone();
		}

		let Ok(_permit) = self.rate_limiter.acquire().await else {
			return GeoInfo::default();
		};

		// Free tier allows 45 requests per minute
		sleep(self.request_delay).await;

		let url = format!("{}{ip}?fields=status,message,countryCode,isp", self.endpoint);

		let response = match self.client.get(&url).send().await {
			Ok(response) if response.status().is_success() => response,
			Ok(response) => {
				warn!("HTTP error for IP {ip}: {}", response.status());
				return GeoInfo::default();
			}
			Err(e) => {
				warn!("Network error for IP {ip}: {e}");
				return GeoInfo::default();
			}
		};

		let data = match response.json::<IpApiResponse>().await {
			Ok(data) => data,
			Err(e) => {
				warn!("Failed to parse response for IP {ip}: {e}");
				return GeoInfo::default();
			}
		};

		let message = data.message.clone();
		match data.into_geo() {
			Some(geo) => {
				debug!("Looked up IP {ip}: {:?} ({:?})", geo.country, geo.isp);
				self.cache.lock().await.insert(ip, geo.clone());
				geo
			}
			None => {
				warn!("Failed to lookup IP {ip}: {}", message.unwrap_or_default());
				GeoInfo::default()
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn maps_successful_answer() {
		let data: IpApiResponse =
			serde_json::from_str(r#"{"status":"success","countryCode":"ES","isp":"OVH SAS"}"#).unwrap();
		assert_eq!(
			data.into_geo(),
			Some(GeoInfo {
				country: Some("ES".into()),
				isp: Some("OVH SAS".into()),
			})
		);
	}

	#[test]
	fn failed_answer_has_no_geo() {
		let data: IpApiResponse =
			serde_json::from_str(r#"{"status":"fail","message":"private range"}"#).unwrap();
		assert_eq!(data.into_geo(), None);
	}

	#[tokio::test]
	async fn cached_answers_skip_the_network() {
		let lookup = GeoLookup::new(&config::Geo {
			enabled: true,
			// nothing listens here, a cache miss would come back empty
			endpoint: "http://127.0.0.1:9/".into(),
			concurrent_requests: 1,
			request_delay_ms: 0,
		});
		let ip = Ipv4Addr::new(8, 8, 8, 8);
		let geo = GeoInfo {
			country: Some("US".into()),
			isp: Some("Google LLC".into()),
		};
		lookup.cache.lock().await.insert(ip, geo.clone());

		assert_eq!(lookup.lookup(ip).await, geo);
		assert_eq!(lookup.lookup(Ipv4Addr::new(1, 1, 1, 1)).await, GeoInfo::default());
	}
}

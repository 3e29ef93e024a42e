//! Typed payloads for the historical service performance API.
//!
//! Request bodies are built here and responses decoded into typed structs.
//! Unknown response fields are ignored; a response that does not have the
//! expected shape at all becomes [`Error::Decode`].

use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::record::DelayRecord;
use crate::task::{DaysTag, Route};
use crate::transport::{Backend, Endpoint, RateLimitedTransport};
use crate::window::TimeWindow;

/// Body of a `serviceMetrics` call.
#[must_use]
pub fn metrics_payload(
    route: &Route,
    date: NaiveDate,
    window: TimeWindow,
    toc_filter: Option<&str>,
) -> Value {
    let days = DaysTag::for_date(date);
    let date = date.format("%Y-%m-%d").to_string();
    let mut payload = json!({
        "from_loc": route.origin,
        "to_loc": route.dest,
        "from_time": window.from_hhmm(),
        "to_time": window.to_hhmm(),
        "from_date": date,
        "to_date": date,
        "days": days.as_str(),
    });
    if let (Some(toc), Some(object)) = (toc_filter, payload.as_object_mut()) {
        object.insert("toc_filter".to_string(), json!([toc]));
    }
    payload
}

/// Body of a `serviceDetails` call.
#[must_use]
pub fn details_payload(rid: &str) -> Value {
    json!({ "rid": rid })
}

/// Accepts identifiers encoded as either strings or numbers.
fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Num(serde_json::Number),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Str(s) => s,
        Raw::Num(n) => n.to_string(),
    })
}

fn rid_list<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    struct Rid(#[serde(deserialize_with = "string_or_number")] String);
    let rids: Option<Vec<Rid>> = Option::deserialize(deserializer)?;
    Ok(rids.unwrap_or_default().into_iter().map(|Rid(r)| r).collect())
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MetricsResponse {
    #[serde(rename = "Services", default)]
    pub services: Vec<ServiceMetrics>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServiceMetrics {
    #[serde(rename = "serviceAttributesMetrics", default)]
    pub attributes: ServiceAttributesMetrics,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServiceAttributesMetrics {
    #[serde(default)]
    pub origin_location: Option<String>,
    #[serde(default)]
    pub destination_location: Option<String>,
    #[serde(default)]
    pub gbtt_ptd: Option<String>,
    #[serde(default)]
    pub gbtt_pta: Option<String>,
    #[serde(default)]
    pub toc_code: Option<String>,
    #[serde(default, deserialize_with = "rid_list")]
    pub rids: Vec<String>,
}

/// A service identifier with the scheduled arrival reported for it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RidRef {
    pub rid: String,
    /// Hour of the scheduled arrival, when the metrics response had one.
    pub hour: Option<u8>,
}

impl MetricsResponse {
    pub fn decode(value: Value) -> Result<Self> {
        if !value.is_object() {
            return Err(Error::Decode(format!(
                "serviceMetrics response is not an object: {}",
                crate::error::truncate_body(&value.to_string())
            )));
        }
        serde_json::from_value(value).map_err(|e| Error::Decode(format!("serviceMetrics: {e}")))
    }

    /// Every identifier in the response, paired with its scheduled-arrival hour.
    #[must_use]
    pub fn rid_refs(&self) -> Vec<RidRef> {
        self.services
            .iter()
            .flat_map(|service| {
                let attrs = &service.attributes;
                let hour = attrs
                    .gbtt_pta
                    .as_deref()
                    .and_then(crate::window::upstream_minutes)
                    .map(|m| (m / 60) as u8);
                attrs.rids.iter().map(move |rid| RidRef {
                    rid: rid.clone(),
                    hour,
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DetailsResponse {
    #[serde(rename = "serviceAttributesDetails", default)]
    pub details: Option<ServiceAttributesDetails>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServiceAttributesDetails {
    #[serde(default)]
    pub locations: Vec<StopRecord>,
}

/// One recorded calling point of a service.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StopRecord {
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub crs: Option<String>,
    #[serde(default)]
    pub gbtt_pta: Option<String>,
    #[serde(default)]
    pub gbtt_ptd: Option<String>,
    #[serde(default)]
    pub actual_ta: Option<String>,
    #[serde(default)]
    pub actual_td: Option<String>,
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(|s| s.trim()).filter(|s| !s.is_empty())
}

impl StopRecord {
    /// Case-insensitive match on either the location or the CRS code.
    #[must_use]
    pub fn matches(&self, code: &str) -> bool {
        [&self.location, &self.crs]
            .into_iter()
            .filter_map(|field| non_empty(field.as_ref()))
            .any(|value| value.eq_ignore_ascii_case(code.trim()))
    }

    /// Public scheduled arrival, falling back to departure.
    #[must_use]
    pub fn scheduled(&self) -> Option<&str> {
        non_empty(self.gbtt_pta.as_ref()).or_else(|| non_empty(self.gbtt_ptd.as_ref()))
    }

    /// Actual arrival, falling back to departure.
    #[must_use]
    pub fn actual(&self) -> Option<&str> {
        non_empty(self.actual_ta.as_ref()).or_else(|| non_empty(self.actual_td.as_ref()))
    }
}

impl DetailsResponse {
    pub fn decode(value: Value) -> Result<Self> {
        if !value.is_object() {
            return Err(Error::Decode(format!(
                "serviceDetails response is not an object: {}",
                crate::error::truncate_body(&value.to_string())
            )));
        }
        serde_json::from_value(value).map_err(|e| Error::Decode(format!("serviceDetails: {e}")))
    }

    #[must_use]
    pub fn stops(&self) -> &[StopRecord] {
        self.details.as_ref().map_or(&[], |d| d.locations.as_slice())
    }

    /// First stop matching `code`.
    #[must_use]
    pub fn find_stop(&self, code: &str) -> Option<&StopRecord> {
        self.stops().iter().find(|stop| stop.matches(code))
    }

    /// Delay record at the route destination, or `None` when the stop or its
    /// times are missing.
    #[must_use]
    pub fn delay_record(&self, route: &Route, rid: &str, date: NaiveDate) -> Option<DelayRecord> {
        let stop = self.find_stop(&route.dest)?;
        DelayRecord::from_times(
            &route.origin,
            &route.dest,
            rid,
            date,
            stop.scheduled()?,
            stop.actual()?,
        )
    }
}

/// Typed client over a [`RateLimitedTransport`].
#[derive(Debug)]
pub struct ServicePerformanceApi<B> {
    transport: RateLimitedTransport<B>,
    metrics_timeout: Duration,
    details_timeout: Duration,
}

impl<B: Backend> ServicePerformanceApi<B> {
    #[must_use]
    pub fn new(
        transport: RateLimitedTransport<B>,
        metrics_timeout: Duration,
        details_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            metrics_timeout,
            details_timeout,
        }
    }

    #[must_use]
    pub fn transport(&self) -> &RateLimitedTransport<B> {
        &self.transport
    }

    pub async fn service_metrics(
        &self,
        route: &Route,
        date: NaiveDate,
        window: TimeWindow,
        toc_filter: Option<&str>,
    ) -> Result<MetricsResponse> {
        let payload = metrics_payload(route, date, window, toc_filter);
        let value = self
            .transport
            .call(Endpoint::ServiceMetrics, payload, self.metrics_timeout)
            .await?;
        MetricsResponse::decode(value)
    }

    pub async fn service_details(&self, rid: &str) -> Result<DetailsResponse> {
        let value = self
            .transport
            .call(Endpoint::ServiceDetails, details_payload(rid), self.details_timeout)
            .await?;
        DetailsResponse::decode(value)
    }
}

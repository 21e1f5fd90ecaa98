use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use polars::prelude::*;
use scraper::Html;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::login::{self, is_login_page, selector, Credentials, Session};
use super::{data_query_string, ObjectReference, PeriodSpec};
use crate::error::{FetchError, ScraperError};
use crate::ApiClient;

/// Chart series of energy taken from the grid.
const CONSUMED: &str = "A+";
/// Chart series of energy fed back into the grid.
const RETURNED: &str = "A-";

pub struct ConsumptionFetcher<'a> {
    client: &'a dyn ApiClient,
}

/// One reading, in kWh.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConsumptionRecord {
    pub timestamp: NaiveDateTime,
    pub value: f64,
}

/// Both raw series of a chart, each in ascending order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EnergyFlows {
    #[serde(rename = "A+")]
    pub consumed: Vec<ConsumptionRecord>,
    #[serde(rename = "A-")]
    pub returned: Vec<ConsumptionRecord>,
}

/// The JSON held in the `data-values` attribute of the chart element.
#[derive(Deserialize, Debug)]
pub struct ChartPayload {
    pub values: BTreeMap<String, ChartSeries>,
}

#[derive(Deserialize, Debug)]
pub struct ChartSeries {
    pub total: ChartTotal,
}

#[derive(Deserialize, Debug)]
pub struct ChartTotal {
    #[serde(default)]
    pub data: Vec<ChartPoint>,
}

#[derive(Deserialize, Debug)]
pub struct ChartPoint {
    pub timestamp: LooseNumber,
    pub value: Option<LooseNumber>,
}

/// The portal is not consistent about quoting numbers.
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum LooseNumber {
    Number(serde_json::Number),
    Text(String),
}

impl LooseNumber {
    fn as_f64(&self) -> Option<f64> {
        match self {
            LooseNumber::Number(n) => n.as_f64(),
            LooseNumber::Text(s) => s.trim().parse().ok(),
        }
    }

    /// Reads a JavaScript timestamp (epoch milliseconds, UTC).
    fn as_timestamp(&self) -> Result<NaiveDateTime, FetchError> {
        let millis = match self {
            LooseNumber::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            LooseNumber::Text(s) => s.trim().parse::<i64>().ok(),
        };
        millis
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .map(|dt| dt.naive_utc())
            .ok_or_else(|| FetchError::MalformedResponse(format!("bad timestamp {:?}", self)))
    }
}

impl<'a> ConsumptionFetcher<'a> {
    const DATA_URL: &'static str = "/lv/private/paterini-un-norekini/paterinu-grafiki/";

    pub fn new(client: &'a dyn ApiClient) -> Self {
        Self { client }
    }

    /// Logs in and returns the session to pass to [`ConsumptionFetcher::fetch`].
    pub fn authenticate(&self, credentials: &Credentials) -> Result<Session, ScraperError> {
        login::authenticate(self.client, credentials)
    }

    /// Returns the readings of one meter for a period, ascending by time.
    ///
    /// With `neto` set, each value is the consumption net of what the object
    /// fed back into the grid over the same interval; otherwise it is the gross
    /// consumption.
    pub fn fetch(
        &self,
        session: &Session,
        object: &ObjectReference,
        period: &PeriodSpec,
        neto: bool,
    ) -> Result<Vec<ConsumptionRecord>, ScraperError> {
        let payload = self.chart_payload(session, object, period)?;
        let records = normalize(&payload, neto)?;

        info!(period = %period, neto, points = records.len(), "consumption fetched");
        Ok(records)
    }

    /// Returns the consumed and returned series side by side, unmodified.
    pub fn fetch_breakdown(
        &self,
        session: &Session,
        object: &ObjectReference,
        period: &PeriodSpec,
    ) -> Result<EnergyFlows, ScraperError> {
        let payload = self.chart_payload(session, object, period)?;
        let flows = EnergyFlows {
            consumed: to_records(series(&payload, CONSUMED, true)?),
            returned: to_records(series(&payload, RETURNED, false)?),
        };

        info!(
            period = %period,
            consumed = flows.consumed.len(),
            returned = flows.returned.len(),
            "energy flows fetched"
        );
        Ok(flows)
    }

    fn chart_payload(
        &self,
        session: &Session,
        object: &ObjectReference,
        period: &PeriodSpec,
    ) -> Result<ChartPayload, ScraperError> {
        period.validate()?;

        let qs = data_query_string(object, period);
        let response = self
            .client
            .http_get(ConsumptionFetcher::DATA_URL, &qs, session.cookies())
            .map_err(FetchError::Transport)?;

        match response.status {
            401 | 403 => return Err(FetchError::Unauthorized(response.status).into()),
            status if !response.is_success() => {
                let excerpt: String = response.body.chars().take(200).collect();
                warn!(status, "consumption request failed");
                return Err(FetchError::Status { status, excerpt }.into());
            }
            _ => {}
        }
        if is_login_page(&response) {
            return Err(FetchError::SessionExpired.into());
        }

        Ok(parse_chart_page(&response.body)?)
    }
}

/// Extracts the chart payload from the consumption page.
pub fn parse_chart_page(page: &str) -> Result<ChartPayload, FetchError> {
    let document = Html::parse_document(page);
    let sel = selector("div.chart").map_err(FetchError::MalformedResponse)?;

    let values = document
        .select(&sel)
        .find_map(|chart| chart.value().attr("data-values"))
        .ok_or(FetchError::MissingChart)?;

    Ok(serde_json::from_str(values)?)
}

/// Reads one series into a time-ordered map. A series the chart lacks is an
/// error only when `required`.
fn series(
    payload: &ChartPayload,
    key: &'static str,
    required: bool,
) -> Result<BTreeMap<NaiveDateTime, f64>, FetchError> {
    let mut points = BTreeMap::new();

    let data = match payload.values.get(key) {
        Some(series) => &series.total.data,
        None if required => {
            return Err(FetchError::MalformedResponse(format!("no {} series", key)));
        }
        None => return Ok(points),
    };

    for point in data {
        let timestamp = point.timestamp.as_timestamp()?;
        let value = match &point.value {
            Some(v) => v.as_f64().ok_or_else(|| {
                FetchError::MalformedResponse(format!("bad {} value {:?} at {}", key, v, timestamp))
            })?,
            // not read yet
            None => {
                debug!(series = key, %timestamp, "skipping point without a value");
                continue;
            }
        };
        if points.insert(timestamp, round_kwh(value)).is_some() {
            return Err(FetchError::DuplicateTimestamp(timestamp, key));
        }
    }
    Ok(points)
}

fn to_records(points: BTreeMap<NaiveDateTime, f64>) -> Vec<ConsumptionRecord> {
    points
        .into_iter()
        .map(|(timestamp, value)| ConsumptionRecord { timestamp, value })
        .collect()
}

/// Meter resolution is one Wh.
fn round_kwh(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Reduces a chart to one value per timestamp: gross consumption, or
/// consumption minus returned energy when `neto` is set. Net values only
/// exist where the meter has a consumption reading.
pub fn normalize(payload: &ChartPayload, neto: bool) -> Result<Vec<ConsumptionRecord>, FetchError> {
    let mut consumed = series(payload, CONSUMED, true)?;
    if !neto {
        return Ok(to_records(consumed));
    }

    let returned = series(payload, RETURNED, false)?;
    for (timestamp, used) in consumed.iter_mut() {
        let fed_in = returned.get(timestamp).copied().unwrap_or(0.0);
        *used = round_kwh(*used - fed_in);
    }
    let unread = returned.keys().filter(|t| !consumed.contains_key(*t)).count();
    if unread > 0 {
        debug!(points = unread, "returned energy without a consumption reading skipped");
    }
    Ok(to_records(consumed))
}

pub trait AsPolarsDf {
    fn as_polars_df(&self) -> Result<DataFrame, anyhow::Error>;
}

impl AsPolarsDf for [ConsumptionRecord] {
    fn as_polars_df(&self) -> Result<DataFrame, anyhow::Error> {
        let timestamps: Vec<NaiveDateTime> = self.iter().map(|r| r.timestamp).collect();
        let values: Vec<f64> = self.iter().map(|r| r.value).collect();

        let df = DataFrame::new(vec![
            Series::new("timestamp".into(), timestamps),
            Series::new("value".into(), values),
        ])?;

        Ok(df)
    }
}

impl AsPolarsDf for EnergyFlows {
    fn as_polars_df(&self) -> Result<DataFrame, anyhow::Error> {
        let mut rows: BTreeMap<NaiveDateTime, (Option<f64>, Option<f64>)> = BTreeMap::new();
        for r in &self.consumed {
            rows.entry(r.timestamp).or_default().0 = Some(r.value);
        }
        for r in &self.returned {
            rows.entry(r.timestamp).or_default().1 = Some(r.value);
        }

        let mut timestamps: Vec<NaiveDateTime> = vec![];
        let mut consumed: Vec<Option<f64>> = vec![];
        let mut returned: Vec<Option<f64>> = vec![];
        for (timestamp, (c, r)) in rows {
            timestamps.push(timestamp);
            consumed.push(c);
            returned.push(r);
        }

        let df = DataFrame::new(vec![
            Series::new("timestamp".into(), timestamps),
            Series::new("consumed".into(), consumed),
            Series::new("returned".into(), returned),
        ])?;

        Ok(df)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    // 2024-02-14T00:00:00Z
    const DAY_START_MS: i64 = 1_707_868_800_000;
    const HOUR_MS: i64 = 3_600_000;

    fn at(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 2, 14)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn payload(json: &str) -> ChartPayload {
        serde_json::from_str(json).unwrap()
    }

    fn two_series() -> ChartPayload {
        payload(&format!(
            r#"{{"values": {{
                "A+": {{"total": {{"data": [
                    {{"timestamp": {t1}, "value": 1.5}},
                    {{"timestamp": {t0}, "value": 2.25}}
                ]}}}},
                "A-": {{"total": {{"data": [
                    {{"timestamp": {t0}, "value": 0.25}},
                    {{"timestamp": {t1}, "value": 2.0}}
                ]}}}}
            }}}}"#,
            t0 = DAY_START_MS,
            t1 = DAY_START_MS + HOUR_MS
        ))
    }

    #[test]
    fn gross_uses_consumed_series_sorted() {
        let records = normalize(&two_series(), false).unwrap();
        assert_eq!(
            records,
            vec![
                ConsumptionRecord {
                    timestamp: at(0),
                    value: 2.25
                },
                ConsumptionRecord {
                    timestamp: at(1),
                    value: 1.5
                },
            ]
        );
    }

    #[test]
    fn neto_offsets_returned_energy() {
        let records = normalize(&two_series(), true).unwrap();
        let values: Vec<f64> = records.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![2.0, -0.5]);
    }

    #[test]
    fn neto_without_production_equals_gross() {
        let chart = payload(&format!(
            r#"{{"values": {{"A+": {{"total": {{"data": [{{"timestamp": {}, "value": 0.75}}]}}}}}}}}"#,
            DAY_START_MS
        ));
        assert_eq!(normalize(&chart, true).unwrap(), normalize(&chart, false).unwrap());
    }

    #[test]
    fn net_values_are_rounded_to_watt_hours() {
        let chart = payload(&format!(
            r#"{{"values": {{
                "A+": {{"total": {{"data": [{{"timestamp": {t}, "value": 0.3}}]}}}},
                "A-": {{"total": {{"data": [{{"timestamp": {t}, "value": 0.1}}]}}}}
            }}}}"#,
            t = DAY_START_MS
        ));
        assert_eq!(normalize(&chart, true).unwrap()[0].value, 0.2);
    }

    #[test]
    fn gross_values_share_the_net_precision() {
        let chart = payload(&format!(
            r#"{{"values": {{"A+": {{"total": {{"data": [{{"timestamp": {}, "value": 0.12345}}]}}}}}}}}"#,
            DAY_START_MS
        ));
        assert_eq!(normalize(&chart, false).unwrap()[0].value, 0.123);
        assert_eq!(normalize(&chart, true).unwrap()[0].value, 0.123);
    }

    #[test]
    fn returned_energy_without_consumption_reading_is_skipped() {
        let chart = payload(&format!(
            r#"{{"values": {{
                "A+": {{"total": {{"data": [
                    {{"timestamp": {t0}, "value": 1.5}},
                    {{"timestamp": {t1}, "value": null}}
                ]}}}},
                "A-": {{"total": {{"data": [
                    {{"timestamp": {t0}, "value": 0.5}},
                    {{"timestamp": {t1}, "value": 0.75}},
                    {{"timestamp": {t2}, "value": 0.25}}
                ]}}}}
            }}}}"#,
            t0 = DAY_START_MS,
            t1 = DAY_START_MS + HOUR_MS,
            t2 = DAY_START_MS + 2 * HOUR_MS
        ));
        let net = normalize(&chart, true).unwrap();
        let gross = normalize(&chart, false).unwrap();

        assert_eq!(
            net,
            vec![ConsumptionRecord {
                timestamp: at(0),
                value: 1.0
            }]
        );
        let net_times: Vec<_> = net.iter().map(|r| r.timestamp).collect();
        let gross_times: Vec<_> = gross.iter().map(|r| r.timestamp).collect();
        assert_eq!(net_times, gross_times);
    }

    #[test]
    fn duplicate_timestamps_are_rejected() {
        let chart = payload(&format!(
            r#"{{"values": {{"A+": {{"total": {{"data": [
                {{"timestamp": {t}, "value": 1}},
                {{"timestamp": {t}, "value": 2}}
            ]}}}}}}}}"#,
            t = DAY_START_MS
        ));
        let err = normalize(&chart, false).unwrap_err();
        assert!(matches!(err, FetchError::DuplicateTimestamp(ts, "A+") if ts == at(0)));
    }

    #[test]
    fn quoted_numbers_and_missing_values_are_tolerated() {
        let chart = payload(&format!(
            r#"{{"values": {{"A+": {{"total": {{"data": [
                {{"timestamp": "{t0}", "value": "0.5"}},
                {{"timestamp": {t1}, "value": null}}
            ]}}}}}}}}"#,
            t0 = DAY_START_MS,
            t1 = DAY_START_MS + HOUR_MS
        ));
        let records = normalize(&chart, false).unwrap();
        assert_eq!(
            records,
            vec![ConsumptionRecord {
                timestamp: at(0),
                value: 0.5
            }]
        );
    }

    #[test]
    fn consumed_series_is_required() {
        let chart = payload(r#"{"values": {"A-": {"total": {"data": []}}}}"#);
        assert!(matches!(
            normalize(&chart, true),
            Err(FetchError::MalformedResponse(_))
        ));
    }

    #[test]
    fn chart_is_read_from_data_attribute() {
        let page = format!(
            r#"<html><body><div class="chart" data-values="{{&quot;values&quot;: {{&quot;A+&quot;: {{&quot;total&quot;: {{&quot;data&quot;: [{{&quot;timestamp&quot;: {}, &quot;value&quot;: 3.5}}]}}}}}}}}"></div></body></html>"#,
            DAY_START_MS
        );
        let chart = parse_chart_page(&page).unwrap();
        assert_eq!(normalize(&chart, false).unwrap()[0].value, 3.5);
    }

    #[test]
    fn page_without_chart_is_an_error() {
        let err = parse_chart_page("<html><body><p>nothing here</p></body></html>").unwrap_err();
        assert!(matches!(err, FetchError::MissingChart));
    }

    #[test]
    fn unparseable_chart_is_an_error() {
        let err = parse_chart_page(r#"<div class="chart" data-values="not json"></div>"#).unwrap_err();
        assert!(matches!(err, FetchError::MalformedResponse(_)));
    }

    #[test]
    fn records_serialize_with_stable_field_names() {
        let record = ConsumptionRecord {
            timestamp: at(23),
            value: 1.25,
        };
        assert_eq!(
            serde_json::to_string(&record).unwrap(),
            r#"{"timestamp":"2024-02-14T23:00:00","value":1.25}"#
        );
    }

    #[test]
    fn flows_frame_joins_on_timestamp() {
        let flows = EnergyFlows {
            consumed: vec![ConsumptionRecord {
                timestamp: at(0),
                value: 1.0,
            }],
            returned: vec![ConsumptionRecord {
                timestamp: at(1),
                value: 0.5,
            }],
        };
        let df = flows.as_polars_df().unwrap();
        assert_eq!(df.shape(), (2, 3));
    }
}

//! Rows of the configuration database
//!
//! The database is produced by the provisioning tool:
//!
//! ```text
//! perfdatasource(idperfdatasource, name, hostname, type, step, heartbeat,
//!                min, max, factor, warning_threshold, critical_threshold,
//!                nagiosname, ventilation)
//! rra(idrra, type, xff, step, rows)
//! pdsrra(idperfdatasource, idrra)
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

/// One datasource of one host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasourceConfig {
    pub id: i64,
    pub host: String,
    pub name: String,
    /// GAUGE, COUNTER, DERIVE or ABSOLUTE
    pub ds_type: String,
    pub step: i64,
    pub heartbeat: i64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub factor: f64,
    pub warning_threshold: Option<String>,
    pub critical_threshold: Option<String>,
    /// Service name used in alerts (`nagiosname` column)
    pub alert_name: Option<String>,
    /// Destination of alerts (`ventilation` column)
    pub routing_key: Option<String>,
}

impl DatasourceConfig {
    pub(crate) const COLUMNS: &'static str = "idperfdatasource, name, hostname, type, step, \
         heartbeat, min, max, factor, warning_threshold, critical_threshold, nagiosname, \
         ventilation";

    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let factor: Option<f64> = row.try_get_unchecked("factor")?;

        Ok(Self {
            id: row.try_get_unchecked("idperfdatasource")?,
            host: row.try_get("hostname")?,
            name: row.try_get("name")?,
            ds_type: row.try_get("type")?,
            step: row.try_get_unchecked("step")?,
            heartbeat: row.try_get_unchecked("heartbeat")?,
            min: row.try_get_unchecked("min")?,
            max: row.try_get_unchecked("max")?,
            factor: factor.unwrap_or(1.0),
            warning_threshold: row.try_get("warning_threshold")?,
            critical_threshold: row.try_get("critical_threshold")?,
            alert_name: row.try_get("nagiosname")?,
            routing_key: row.try_get("ventilation")?,
        })
    }

    /// `DS:` argument of `rrdtool create`; missing bounds are `U`
    pub fn ds_argument(&self) -> String {
        format!(
            "DS:DS:{}:{}:{}:{}",
            self.ds_type,
            self.heartbeat,
            Bound(self.min),
            Bound(self.max)
        )
    }
}

struct Bound(Option<f64>);

impl fmt::Display for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(value) => write!(f, "{value}"),
            None => f.write_str("U"),
        }
    }
}

/// Consolidation rule of an RRD file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionArchive {
    /// AVERAGE, MIN, MAX or LAST
    pub aggregation: String,
    pub xff: f64,
    pub step_multiplier: i64,
    pub rows: i64,
}

impl RetentionArchive {
    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            aggregation: row.try_get("type")?,
            xff: row.try_get_unchecked("xff")?,
            step_multiplier: row.try_get_unchecked("step")?,
            rows: row.try_get_unchecked("rows")?,
        })
    }

    /// `RRA:` argument of `rrdtool create`
    pub fn rra_argument(&self) -> String {
        format!(
            "RRA:{}:{}:{}:{}",
            self.aggregation, self.xff, self.step_multiplier, self.rows
        )
    }
}

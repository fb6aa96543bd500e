//! CSV import of address pairs and export of aligned result tables.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use csv::{ReaderBuilder, Trim, Writer};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::AppResult;
use crate::geocoder::ServiceId;
use crate::resolver::{AddressPair, DistanceResult};

#[derive(Debug, Deserialize)]
struct PairRecord {
    #[serde(default)]
    address1: String,
    #[serde(default)]
    address2: String,
    #[serde(default)]
    region1: Option<String>,
    #[serde(default)]
    region2: Option<String>,
}

#[derive(Debug, Serialize)]
struct ResultRecord<'a> {
    address1: &'a str,
    address2: &'a str,
    distance_km: Option<f64>,
    source: &'static str,
    status: &'static str,
    message: &'a str,
    nominatim_km: Option<f64>,
    ors_km: Option<f64>,
    discrepancy_percent: Option<f64>,
}

impl<'a> From<&'a DistanceResult> for ResultRecord<'a> {
    fn from(result: &'a DistanceResult) -> Self {
        Self {
            address1: &result.pair.origin,
            address2: &result.pair.destination,
            distance_km: result.final_distance,
            source: result.source.as_str(),
            status: result.status.as_str(),
            message: &result.message,
            nominatim_km: result.candidate(ServiceId::Nominatim),
            ors_km: result.candidate(ServiceId::OpenRouteService),
            discrepancy_percent: result.discrepancy_percent,
        }
    }
}

/// Reads `address1,address2[,region1,region2]` rows. Every data row yields
/// a pair, blank cells included, so row positions stay stable.
pub fn read_pairs<R: Read>(reader: R) -> AppResult<Vec<AddressPair>> {
    let mut csv_reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(reader);

    let mut pairs = Vec::new();
    for record in csv_reader.deserialize::<PairRecord>() {
        let record = record?;
        pairs.push(
            AddressPair::new(record.address1, record.address2)
                .with_regions(record.region1, record.region2),
        );
    }
    debug!(target: "table", rows = pairs.len(), "address pairs loaded");
    Ok(pairs)
}

pub fn read_pairs_csv<P: AsRef<Path>>(path: P) -> AppResult<Vec<AddressPair>> {
    read_pairs(File::open(path)?)
}

pub fn write_results<W: Write>(writer: W, results: &[DistanceResult]) -> AppResult<()> {
    let mut csv_writer = Writer::from_writer(writer);
    for result in results {
        csv_writer.serialize(ResultRecord::from(result))?;
    }
    csv_writer.flush()?;
    Ok(())
}

pub fn write_results_csv<P: AsRef<Path>>(path: P, results: &[DistanceResult]) -> AppResult<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file = BufWriter::new(File::create(path)?);
    write_results(file, results)?;
    debug!(target: "table", path = %path.display(), rows = results.len(), "result table written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tempfile::tempdir;

    use crate::resolver::{DistanceSource, ResolutionStatus};

    use super::*;

    #[test]
    fn reads_pairs_with_optional_regions_and_blank_cells() {
        let input = "address1,address2,region1,region2\n\
                     Lille,Paris,Nord,\n\
                     ,Lyon\n\
                     St Omer , Arras ,Pas-de-Calais,Pas-de-Calais\n";
        let pairs = read_pairs(input.as_bytes()).unwrap();

        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0].origin_region.as_deref(), Some("Nord"));
        assert_eq!(pairs[0].destination_region, None);
        assert!(pairs[1].is_blank());
        assert_eq!(pairs[2].origin, "St Omer");
        assert_eq!(pairs[2].destination, "Arras");
    }

    #[test]
    fn writes_one_row_per_result() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out").join("results.csv");
        let mut distance_by_source = BTreeMap::new();
        distance_by_source.insert(ServiceId::Nominatim, Some(100.0));
        distance_by_source.insert(ServiceId::OpenRouteService, Some(120.0));
        let results = vec![
            DistanceResult {
                final_distance: Some(100.0),
                distance_by_source,
                source: DistanceSource::Nominatim,
                status: ResolutionStatus::Warning,
                message: "large difference".into(),
                discrepancy_percent: Some(16.67),
                pair: AddressPair::new("Paris", "Lyon"),
            },
            DistanceResult::missing_address(AddressPair::new("", "Lyon")),
        ];

        write_results_csv(&path, &results).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = written.lines().collect();

        assert_eq!(
            lines[0],
            "address1,address2,distance_km,source,status,message,nominatim_km,ors_km,discrepancy_percent"
        );
        assert_eq!(lines[1], "Paris,Lyon,100.0,nominatim,warning,large difference,100.0,120.0,16.67");
        assert_eq!(lines[2], ",Lyon,,none,error,missing address,,,");
        assert_eq!(lines.len(), 3);
    }
}

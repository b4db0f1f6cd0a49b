//! Importer for OpenCV's stump-based Haar cascade XML (`haarcascade_*.xml`).
//!
//! Only the post-2.4 `<cascade>` layout with `BOOST` stages, `HAAR` features
//! and single-split weak classifiers is accepted, which covers the stock
//! frontal-face cascades.

use super::{Cascade, DetectorError, Stage, WeakClassifier, WeightedRect};
use serde::Deserialize;
use std::str::FromStr;

#[derive(Deserialize)]
struct Storage {
    cascade: RawCascade,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCascade {
    stage_type: String,
    feature_type: String,
    width: String,
    height: String,
    stages: Items<RawStage>,
    features: Items<RawFeature>,
}

/// OpenCV writes sequences as repeated `<_>` children.
#[derive(Deserialize)]
struct Items<T> {
    #[serde(rename = "_", default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStage {
    stage_threshold: String,
    weak_classifiers: Items<RawWeak>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawWeak {
    internal_nodes: String,
    leaf_values: String,
}

#[derive(Deserialize)]
struct RawFeature {
    rects: Items<String>,
    #[serde(default)]
    tilted: Option<String>,
}

fn invalid(message: impl ToString) -> DetectorError {
    DetectorError::InvalidCascade(message.to_string())
}

fn number<T: FromStr>(text: &str, what: &str) -> Result<T, DetectorError> {
    text.trim()
        .parse()
        .map_err(|_| invalid(format!("{what}: cannot parse {:?}", text.trim())))
}

fn numbers<T: FromStr>(text: &str, what: &str) -> Result<Vec<T>, DetectorError> {
    text.split_whitespace().map(|t| number(t, what)).collect()
}

/// Parse an OpenCV cascade document into a [`Cascade`].
pub(super) fn parse(xml: &str) -> Result<Cascade, DetectorError> {
    let storage: Storage = quick_xml::de::from_str(xml).map_err(invalid)?;
    let raw = storage.cascade;

    if raw.stage_type.trim() != "BOOST" {
        return Err(invalid(format!("unsupported stageType {}", raw.stage_type.trim())));
    }
    if raw.feature_type.trim() != "HAAR" {
        return Err(invalid(format!("unsupported featureType {}", raw.feature_type.trim())));
    }

    let features = raw
        .features
        .items
        .iter()
        .enumerate()
        .map(|(i, f)| feature(i, f))
        .collect::<Result<Vec<_>, _>>()?;

    let stages = raw
        .stages
        .items
        .iter()
        .enumerate()
        .map(|(s, stage)| {
            let classifiers = stage
                .weak_classifiers
                .items
                .iter()
                .map(|weak| stump(s, weak, &features))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Stage {
                threshold: number(&stage.stage_threshold, "stageThreshold")?,
                classifiers,
            })
        })
        .collect::<Result<Vec<_>, DetectorError>>()?;

    Ok(Cascade {
        window_width: number(&raw.width, "width")?,
        window_height: number(&raw.height, "height")?,
        stages,
    })
}

fn feature(index: usize, raw: &RawFeature) -> Result<Vec<WeightedRect>, DetectorError> {
    if let Some(tilted) = &raw.tilted {
        if number::<u32>(tilted, "tilted")? != 0 {
            return Err(invalid(format!("feature {index} is tilted; only upright features are supported")));
        }
    }
    raw.rects
        .items
        .iter()
        .map(|text| {
            let fields: Vec<&str> = text.split_whitespace().collect();
            let [x, y, w, h, weight] = fields[..] else {
                return Err(invalid(format!("feature {index}: rect {:?} needs 5 values", text.trim())));
            };
            Ok(WeightedRect {
                x: number(x, "rect x")?,
                y: number(y, "rect y")?,
                width: number(w, "rect width")?,
                height: number(h, "rect height")?,
                weight: number(weight, "rect weight")?,
            })
        })
        .collect()
}

/// `internalNodes` is `left right feature threshold`; child indices `<= 0` name leaf values.
fn stump(
    stage: usize,
    raw: &RawWeak,
    features: &[Vec<WeightedRect>],
) -> Result<WeakClassifier, DetectorError> {
    let nodes: Vec<&str> = raw.internal_nodes.split_whitespace().collect();
    let [left, right, feature_idx, threshold] = nodes[..] else {
        return Err(invalid(format!(
            "stage {stage}: weak classifier has {} node values; only stumps are supported",
            nodes.len()
        )));
    };
    let leaves: Vec<f32> = numbers(&raw.leaf_values, "leafValues")?;
    let leaf = |child: &str| -> Result<f32, DetectorError> {
        let idx: i64 = number(child, "child index")?;
        if idx > 0 {
            return Err(invalid(format!("stage {stage}: weak classifier is not a stump")));
        }
        leaves
            .get(idx.unsigned_abs() as usize)
            .copied()
            .ok_or_else(|| invalid(format!("stage {stage}: leaf {} missing", -idx)))
    };
    let feature_idx: usize = number(feature_idx, "feature index")?;
    let rects = features
        .get(feature_idx)
        .cloned()
        .ok_or_else(|| invalid(format!("stage {stage}: feature {feature_idx} not defined")))?;

    Ok(WeakClassifier {
        rects,
        threshold: number(threshold, "node threshold")?,
        left: leaf(left)?,
        right: leaf(right)?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::detector::tests::center_bright_cascade;

    /// The centre-brighter cascade written the way OpenCV stores cascades.
    pub(crate) const CENTER_BRIGHT_XML: &str = r#"<?xml version="1.0"?>
<opencv_storage>
<cascade type_id="opencv-cascade-classifier"><stageType>BOOST</stageType>
  <featureType>HAAR</featureType>
  <height>20</height>
  <width>20</width>
  <stageParams>
    <maxWeakCount>1</maxWeakCount></stageParams>
  <featureParams>
    <maxCatCount>0</maxCatCount></featureParams>
  <stageNum>1</stageNum>
  <stages>
    <!-- stage 0 -->
    <_>
      <maxWeakCount>1</maxWeakCount>
      <stageThreshold>0.</stageThreshold>
      <weakClassifiers>
        <_>
          <internalNodes>
            0 -1 0 5.0000000000000000e-01</internalNodes>
          <leafValues>
            -1. 1.</leafValues></_></weakClassifiers></_></stages>
  <features>
    <_>
      <rects>
        <_>
          0 0 20 20 -1.</_>
        <_>
          5 5 10 10 4.</_></rects></_></features></cascade>
</opencv_storage>
"#;

    #[test]
    fn test_parse_matches_json_equivalent() {
        assert_eq!(parse(CENTER_BRIGHT_XML).unwrap(), center_bright_cascade());
    }

    #[test]
    fn test_rejects_multi_node_trees() {
        let xml = CENTER_BRIGHT_XML.replace(
            "0 -1 0 5.0000000000000000e-01",
            "1 -1 0 5.0e-01 0 -2 0 1.0e-01",
        );
        assert!(matches!(parse(&xml), Err(DetectorError::InvalidCascade(_))));
    }

    #[test]
    fn test_rejects_lbp_features() {
        let xml = CENTER_BRIGHT_XML.replace(">HAAR<", ">LBP<");
        let err = parse(&xml).unwrap_err();
        assert!(err.to_string().contains("featureType"), "{err}");
    }

    #[test]
    fn test_rejects_undefined_feature_index() {
        let xml = CENTER_BRIGHT_XML.replace("0 -1 0 5.0000000000000000e-01", "0 -1 3 5.0e-01");
        let err = parse(&xml).unwrap_err();
        assert!(err.to_string().contains("feature 3"), "{err}");
    }

    #[test]
    fn test_rejects_tilted_features() {
        let xml = CENTER_BRIGHT_XML.replace("</rects></_></features>", "</rects>\n      <tilted>1</tilted></_></features>");
        assert!(matches!(parse(&xml), Err(DetectorError::InvalidCascade(_))));
    }

    #[test]
    fn test_not_a_cascade_document() {
        assert!(matches!(
            parse("<opencv_storage><other>1</other></opencv_storage>"),
            Err(DetectorError::InvalidCascade(_))
        ));
    }
}

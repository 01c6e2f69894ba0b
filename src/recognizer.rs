use crate::{
    api::PlateCandidate,
    image::{Image, encode_jpeg},
};
use anyhow::{Context, bail};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::debug;

/// Number plate recognizer. The result holds exactly one candidate list per input image.
#[async_trait]
pub trait PlateRecognizer: Send + Sync {
    async fn run(&self, images: &[Image]) -> anyhow::Result<Vec<Vec<PlateCandidate>>>;
}

/// One plate as returned by the ANPR service.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawPlate {
    det_box: Option<Vec<f32>>,
    det_conf: Option<f32>,
    #[allow(dead_code)]
    rec_poly: serde_json::Value,
    rec_text: Option<String>,
    rec_conf: Option<f32>,
}

impl From<RawPlate> for PlateCandidate {
    fn from(raw: RawPlate) -> Self {
        PlateCandidate::new(
            raw.det_box.as_deref(),
            raw.det_conf,
            raw.rec_text,
            raw.rec_conf,
        )
    }
}

/// Parses an ANPR response body and checks that it covers every submitted image.
pub fn parse_recognizer_response(
    body: &[u8],
    image_count: usize,
) -> anyhow::Result<Vec<Vec<PlateCandidate>>> {
    let raw: Vec<Vec<RawPlate>> =
        serde_json::from_slice(body).context("Malformed recognizer response")?;
    if raw.len() != image_count {
        bail!(
            "Recognizer returned {} results for {} images",
            raw.len(),
            image_count
        );
    }
    Ok(raw
        .into_iter()
        .map(|plates| plates.into_iter().map(PlateCandidate::from).collect())
        .collect())
}

/// Posts every image as a JPEG `images` part to a remote ANPR endpoint.
pub struct HttpPlateRecognizer {
    client: reqwest::Client,
    url: reqwest::Url,
    jpeg_quality: u8,
}

impl HttpPlateRecognizer {
    pub fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let url =
            reqwest::Url::parse(url).with_context(|| format!("Invalid recognizer url {url}"))?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url,
            jpeg_quality: 95,
        })
    }
}

#[async_trait]
impl PlateRecognizer for HttpPlateRecognizer {
    async fn run(&self, images: &[Image]) -> anyhow::Result<Vec<Vec<PlateCandidate>>> {
        if images.is_empty() {
            return Ok(Vec::new());
        }
        let request_start_time = Instant::now();

        let mut form = reqwest::multipart::Form::new();
        for (index, image) in images.iter().enumerate() {
            let part = reqwest::multipart::Part::bytes(encode_jpeg(image, self.jpeg_quality)?)
                .file_name(format!("image_{index}.jpg"))
                .mime_str(mime::IMAGE_JPEG.as_ref())?;
            form = form.part("images", part);
        }

        let response = self
            .client
            .post(self.url.clone())
            .multipart(form)
            .send()
            .await
            .context("Recognizer request failed")?;
        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            bail!(
                "Recognizer responded with {status}: {}",
                String::from_utf8_lossy(&body)
            );
        }

        let plates = parse_recognizer_response(&body, images.len())?;
        debug!(
            images = images.len(),
            plates = plates.iter().map(Vec::len).sum::<usize>(),
            elapsed = ?request_start_time.elapsed(),
            "Recognizer round trip"
        );
        Ok(plates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::DetectionBox;

    #[test]
    fn test_parse_response_rounds_and_defaults() {
        let body = br#"[
            [{"det_box": [10.7, 20.2, 110.9, 60.0], "det_conf": 0.876, "rec_poly": [[1, 2]],
              "rec_text": "AB123", "rec_conf": 0.914}],
            [{"det_box": null, "det_conf": null, "rec_text": null, "rec_conf": null}],
            []
        ]"#;
        let plates = parse_recognizer_response(body, 3).unwrap();
        assert_eq!(plates.len(), 3);

        let first = &plates[0][0];
        assert_eq!(
            first.detection_bbox,
            DetectionBox {
                xmin: 10,
                ymin: 20,
                xmax: 110,
                ymax: 60
            }
        );
        assert_eq!(first.detection_confidence, Some(0.88));
        assert_eq!(first.recognition_confidence, Some(0.91));
        assert_eq!(first.recognition_text, "AB123");

        let second = &plates[1][0];
        assert_eq!(second.detection_bbox, DetectionBox::default());
        assert_eq!(second.detection_confidence, None);
        assert!(!second.has_text());
        assert!(plates[2].is_empty());
    }

    #[test]
    fn test_parse_response_count_mismatch() {
        let err = parse_recognizer_response(b"[[]]", 2).unwrap_err();
        assert!(err.to_string().contains("1 results for 2 images"));
        assert!(parse_recognizer_response(b"{}", 1).is_err());
    }

    #[tokio::test]
    async fn test_empty_batch_skips_request() {
        // Unroutable port, any request would fail
        let recognizer =
            HttpPlateRecognizer::new("http://127.0.0.1:9/anpr", Duration::from_millis(10))
                .unwrap();
        assert!(recognizer.run(&[]).await.unwrap().is_empty());
    }
}

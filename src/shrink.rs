//! Keeps outgoing results under the transport payload ceiling.
//!
//! Screenshots are the only large binary content in a result, so shrinking
//! is mostly JPEG recompression: downscale to a fixed width, then walk a
//! quality ladder until a candidate fits the per-image budget.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use prost::Message;
use serde_json::Value;
use tracing::{error, warn};

use crate::models::AgentResult;

pub const RESULT_BUDGET: usize = 800_000;
pub const CAPTURE_IMAGE_BUDGET: usize = 300_000;
pub const STEP_IMAGE_BUDGET: usize = 150_000;
pub const HISTORY_IMAGE_BUDGET: usize = 200_000;
pub const HISTORY_SCREENSHOT_LIMIT: usize = 5;

const TARGET_WIDTH: u32 = 480;
const QUALITY_START: u8 = 50;
const QUALITY_FLOOR: u8 = 30;
const QUALITY_STEP: u8 = 5;
const MINIMAL_TEXT_LIMIT: usize = 4096;
const JPEG_MIME: &str = "image/jpeg";

#[derive(Debug, Clone, Copy)]
pub struct PayloadShrinker {
  send_screenshots: bool,
}

impl PayloadShrinker {
  pub fn new(send_screenshots: bool) -> Self {
    Self { send_screenshots }
  }

  pub fn send_screenshots(&self) -> bool {
    self.send_screenshots
  }

  /// Recompresses embedded screenshots. The returned result is never larger
  /// than the input; it may still exceed `max_bytes` when the text content
  /// alone is too large, which the publisher handles with [`Self::minimal`].
  pub fn bound(&self, mut result: AgentResult, max_bytes: usize) -> AgentResult {
    if let Some(step) = result.step.as_mut() {
      if !self.send_screenshots {
        step.screenshot_bytes.clear();
        step.screenshot_mime_type.clear();
      } else if let Some(jpeg) = compress_image(&step.screenshot_bytes, STEP_IMAGE_BUDGET) {
        step.screenshot_bytes = jpeg;
        step.screenshot_mime_type = JPEG_MIME.into();
      }
    }
    result.history_json = self.compress_history_json(&result.history_json);
    result.partial_history_json = self.compress_history_json(&result.partial_history_json);

    let size = result.encoded_len();
    if size > max_bytes {
      warn!(size, max_bytes, "result payload still above limit after compression");
    }
    result
  }

  /// Applies the head/middle/tail retention and per-image budget to the
  /// `screenshots` list of a serialized history snapshot.
  pub fn compress_history_json(&self, history_json: &str) -> String {
    if history_json.is_empty() {
      return String::new();
    }
    let Ok(mut data) = serde_json::from_str::<Value>(history_json) else {
      return history_json.to_string();
    };
    if let Some(Value::Array(items)) = data.get_mut("screenshots") {
      if self.send_screenshots {
        *items = limit_screenshots(items, HISTORY_SCREENSHOT_LIMIT)
          .into_iter()
          .map(|item| match item {
            Value::String(raw) => {
              let mime = data_url_mime(&raw).unwrap_or("image/png").to_string();
              Value::String(compress_data_url(&raw, &mime, HISTORY_IMAGE_BUDGET))
            }
            other => other,
          })
          .collect();
      } else {
        items.clear();
      }
    }
    match serde_json::to_string(&data) {
      Ok(rewritten) if rewritten.len() <= history_json.len() => rewritten,
      _ => history_json.to_string(),
    }
  }

  /// Last resort when the transport still rejects the payload: keeps status,
  /// metadata and error text only, truncating text until it fits.
  pub fn minimal(result: &AgentResult, max_bytes: usize) -> AgentResult {
    let mut minimal = result.clone();
    minimal.history_json.clear();
    minimal.partial_history_json.clear();
    if let Some(step) = minimal.step.as_mut() {
      step.screenshot_bytes.clear();
      step.model_actions_json.clear();
      step.model_outputs_json.clear();
      step.action_results_json.clear();
      step.state_json.clear();
    }

    truncate_until_fits(&mut minimal, max_bytes, free_text_fields);
    truncate_until_fits(&mut minimal, max_bytes, identifying_fields);
    let size = minimal.encoded_len();
    if size > max_bytes {
      error!(size, limit = max_bytes, "minimal result still exceeds the payload limit");
    }
    minimal
  }
}

/// Returns a smaller JPEG rendition of `data`, or `None` when the input is
/// already within budget or could not be improved.
pub fn compress_image(data: &[u8], max_bytes: usize) -> Option<Vec<u8>> {
  if data.is_empty() || data.len() <= max_bytes {
    return None;
  }
  match recompress(data, max_bytes) {
    Ok(best) if !best.is_empty() && best.len() < data.len() => Some(best),
    Ok(_) => None,
    Err(err) => {
      warn!(error = %err, "screenshot compression failed; keeping original bytes");
      None
    }
  }
}

fn recompress(data: &[u8], max_bytes: usize) -> image::ImageResult<Vec<u8>> {
  let mut rgb = image::load_from_memory(data)?.to_rgb8();
  if rgb.width() > TARGET_WIDTH {
    let height = (u64::from(rgb.height()) * u64::from(TARGET_WIDTH) / u64::from(rgb.width())).max(1) as u32;
    rgb = imageops::resize(&rgb, TARGET_WIDTH, height, FilterType::Triangle);
  }

  let mut best: Option<Vec<u8>> = None;
  let mut quality = QUALITY_START;
  loop {
    let mut candidate = Vec::new();
    JpegEncoder::new_with_quality(&mut candidate, quality).encode_image(&rgb)?;
    if candidate.len() <= max_bytes {
      return Ok(candidate);
    }
    if best.as_ref().is_none_or(|b| candidate.len() < b.len()) {
      best = Some(candidate);
    }
    if quality <= QUALITY_FLOOR {
      break;
    }
    quality = quality.saturating_sub(QUALITY_STEP).max(QUALITY_FLOOR);
  }
  Ok(best.unwrap_or_default())
}

/// Recompresses a screenshot given either as a data URL or as bare base64.
/// Bare base64 always comes back as a data URL.
pub fn compress_data_url(raw: &str, mime_type: &str, max_bytes: usize) -> String {
  let data = raw.trim();
  if let Some(rest) = data.strip_prefix("data:") {
    let Some((_, payload)) = rest.split_once(";base64,") else {
      return data.to_string();
    };
    return match STANDARD.decode(payload) {
      Ok(decoded) => match compress_image(&decoded, max_bytes) {
        Some(jpeg) => format!("data:{JPEG_MIME};base64,{}", STANDARD.encode(jpeg)),
        None => data.to_string(),
      },
      Err(_) => data.to_string(),
    };
  }
  match STANDARD.decode(data) {
    Ok(decoded) => match compress_image(&decoded, max_bytes) {
      Some(jpeg) => format!("data:{JPEG_MIME};base64,{}", STANDARD.encode(jpeg)),
      None => format!("data:{mime_type};base64,{data}"),
    },
    Err(_) => format!("data:{mime_type};base64,{data}"),
  }
}

fn data_url_mime(value: &str) -> Option<&str> {
  let rest = value.strip_prefix("data:")?;
  rest.split(';').next().filter(|mime| !mime.is_empty())
}

/// Keeps the first two and last two entries plus a slice taken from the
/// start of the remainder.
pub fn limit_screenshots<T: Clone>(items: &[T], max_items: usize) -> Vec<T> {
  if items.len() <= max_items {
    return items.to_vec();
  }
  let head = max_items.min(2);
  let tail = (max_items - head).min(2);
  let middle = max_items - head - tail;
  let mut kept = Vec::with_capacity(max_items);
  kept.extend_from_slice(&items[..head]);
  kept.extend_from_slice(&items[head..head + middle]);
  kept.extend_from_slice(&items[items.len() - tail..]);
  kept
}

/// Halves the allowance for `fields` until the result fits or they are empty.
fn truncate_until_fits(result: &mut AgentResult, max_bytes: usize, fields: fn(&mut AgentResult) -> Vec<&mut String>) {
  let mut limit = MINIMAL_TEXT_LIMIT;
  while result.encoded_len() > max_bytes {
    for field in fields(result) {
      truncate_at_char(field, limit);
    }
    if limit == 0 {
      break;
    }
    limit /= 2;
  }
}

fn free_text_fields(result: &mut AgentResult) -> Vec<&mut String> {
  let mut fields = vec![&mut result.message, &mut result.error];
  if let Some(step) = result.step.as_mut() {
    fields.extend([&mut step.observation, &mut step.error, &mut step.url, &mut step.screenshot_path]);
  }
  fields
}

// Only reached when ids or timestamps alone overflow the limit.
fn identifying_fields(result: &mut AgentResult) -> Vec<&mut String> {
  let mut fields = vec![
    &mut result.testbook_id,
    &mut result.environment_id,
    &mut result.started_at,
    &mut result.finished_at,
  ];
  if let Some(metadata) = result.metadata.as_mut() {
    fields.extend([
      &mut metadata.agent_id,
      &mut metadata.project_id,
      &mut metadata.run_id,
      &mut metadata.agent_version,
    ]);
  }
  if let Some(step) = result.step.as_mut() {
    fields.extend([&mut step.action_name, &mut step.screenshot_mime_type, &mut step.timestamp]);
  }
  fields
}

fn truncate_at_char(value: &mut String, max: usize) {
  if value.len() <= max {
    return;
  }
  let mut end = max;
  while !value.is_char_boundary(end) {
    end -= 1;
  }
  value.truncate(end);
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::{AgentMetadata, AgentResultKind, AgentStepResult};
  use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
  use std::io::Cursor;

  fn noisy_png(width: u32, height: u32) -> Vec<u8> {
    noise_png(width, height, 0xFF, 0)
  }

  fn noise_png(width: u32, height: u32, mask: u8, base: u8) -> Vec<u8> {
    let mut seed: u32 = 0x1234_5678;
    let img = RgbImage::from_fn(width, height, |_, _| {
      seed ^= seed << 13;
      seed ^= seed >> 17;
      seed ^= seed << 5;
      let b = seed.to_le_bytes();
      Rgb([(b[0] & mask) + base, (b[1] & mask) + base, (b[2] & mask) + base])
    });
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img).write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
  }

  fn step_result(screenshot: Vec<u8>) -> AgentResult {
    AgentResult {
      metadata: Some(AgentMetadata { run_id: "run-1".into(), ..Default::default() }),
      kind: AgentResultKind::Step as i32,
      status: "STATUS_RUNNING".into(),
      step: Some(AgentStepResult {
        step_index: 1,
        screenshot_mime_type: "image/png".into(),
        screenshot_bytes: screenshot,
        model_actions_json: "[{\"click\":{}}]".into(),
        ..Default::default()
      }),
      ..Default::default()
    }
  }

  #[test]
  fn small_images_are_left_alone() {
    let png = noisy_png(16, 16);
    assert!(compress_image(&png, png.len()).is_none());
    assert!(compress_image(&[], 10).is_none());
  }

  #[test]
  fn wide_images_are_downscaled_to_target_width() {
    let png = noisy_png(960, 640);
    let jpeg = compress_image(&png, STEP_IMAGE_BUDGET).expect("smaller rendition");
    assert!(jpeg.len() < png.len());
    let decoded = image::load_from_memory(&jpeg).unwrap();
    assert_eq!(decoded.width(), 480);
    assert_eq!(decoded.height(), 320);
  }

  #[test]
  fn narrow_images_are_never_upscaled() {
    let png = noisy_png(200, 100);
    let jpeg = compress_image(&png, 1_000).expect("smaller rendition");
    let decoded = image::load_from_memory(&jpeg).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (200, 100));
  }

  #[test]
  fn undecodable_bytes_are_kept() {
    let garbage = vec![7u8; 4096];
    assert!(compress_image(&garbage, 100).is_none());
    let url = compress_data_url(&STANDARD.encode(&garbage), "image/png", 100);
    assert!(url.starts_with("data:image/png;base64,"));
  }

  #[test]
  fn data_urls_are_rewritten_as_jpeg() {
    let png = noisy_png(640, 480);
    let url = format!("data:image/png;base64,{}", STANDARD.encode(&png));
    let compressed = compress_data_url(&url, "image/png", HISTORY_IMAGE_BUDGET);
    assert!(compressed.starts_with("data:image/jpeg;base64,"));
    assert!(compressed.len() < url.len());
  }

  #[test]
  fn screenshot_retention_keeps_head_middle_and_tail() {
    let items: Vec<u32> = (0..10).collect();
    assert_eq!(limit_screenshots(&items, 5), vec![0, 1, 2, 8, 9]);
    assert_eq!(limit_screenshots(&items, 3), vec![0, 1, 9]);
    assert_eq!(limit_screenshots(&items, 2), vec![0, 1]);
    assert_eq!(limit_screenshots(&items[..4], 5), vec![0, 1, 2, 3]);
  }

  #[test]
  fn bound_shrinks_step_screenshot() {
    let png = noisy_png(960, 640);
    let input = step_result(png.clone());
    let before = input.encoded_len();
    let bounded = PayloadShrinker::new(true).bound(input, RESULT_BUDGET);
    let step = bounded.step.as_ref().unwrap();
    assert!(step.screenshot_bytes.len() < png.len());
    assert_eq!(step.screenshot_mime_type, "image/jpeg");
    assert!(bounded.encoded_len() <= before);
    assert!(bounded.encoded_len() <= RESULT_BUDGET);
  }

  #[test]
  fn bound_caps_history_screenshots() {
    let png = noise_png(600, 400, 0x3F, 96);
    assert!(png.len() > HISTORY_IMAGE_BUDGET);
    let url = format!("data:image/png;base64,{}", STANDARD.encode(&png));
    let history = serde_json::json!({ "urls": ["https://a"], "screenshots": vec![url; 8] }).to_string();
    let input = AgentResult { history_json: history.clone(), ..Default::default() };
    let before = input.encoded_len();
    let bounded = PayloadShrinker::new(true).bound(input, RESULT_BUDGET);

    let parsed: Value = serde_json::from_str(&bounded.history_json).unwrap();
    assert_eq!(parsed["screenshots"].as_array().unwrap().len(), 5);
    assert_eq!(parsed["urls"][0], "https://a");
    assert!(bounded.encoded_len() < before);
    assert!(bounded.encoded_len() <= RESULT_BUDGET);
  }

  #[test]
  fn disabled_screenshots_are_dropped_regardless_of_size() {
    let history = serde_json::json!({ "screenshots": ["data:image/png;base64,AAAA"] }).to_string();
    let mut input = step_result(vec![1, 2, 3]);
    input.partial_history_json = history;
    let bounded = PayloadShrinker::new(false).bound(input, RESULT_BUDGET);
    assert!(bounded.step.as_ref().unwrap().screenshot_bytes.is_empty());
    let parsed: Value = serde_json::from_str(&bounded.partial_history_json).unwrap();
    assert!(parsed["screenshots"].as_array().unwrap().is_empty());
  }

  #[test]
  fn unparsable_history_is_passed_through() {
    let shrinker = PayloadShrinker::new(true);
    assert_eq!(shrinker.compress_history_json("not json"), "not json");
    assert_eq!(shrinker.compress_history_json(""), "");
  }

  #[test]
  fn minimal_result_fits_even_with_huge_error() {
    let mut input = step_result(vec![0u8; 900_000]);
    input.history_json = "x".repeat(500_000);
    input.error = "é".repeat(600_000);
    let minimal = PayloadShrinker::minimal(&input, 1_000);
    assert!(minimal.encoded_len() <= 1_000);
    assert!(minimal.history_json.is_empty());
    let step = minimal.step.as_ref().unwrap();
    assert!(step.screenshot_bytes.is_empty());
    assert!(step.model_actions_json.is_empty());
    assert_eq!(minimal.status, "STATUS_RUNNING");
    assert_eq!(minimal.metadata.as_ref().unwrap().run_id, "run-1");
  }

  #[test]
  fn minimal_result_fits_when_ids_are_oversized() {
    let mut input = step_result(Vec::new());
    input.testbook_id = "t".repeat(3_000);
    input.environment_id = "e".repeat(3_000);
    if let Some(metadata) = input.metadata.as_mut() {
      metadata.project_id = "p".repeat(3_000);
    }
    if let Some(step) = input.step.as_mut() {
      step.action_name = "a".repeat(3_000);
    }
    let minimal = PayloadShrinker::minimal(&input, 2_000);
    assert!(minimal.encoded_len() <= 2_000);
    assert_eq!(minimal.status, "STATUS_RUNNING");
  }
}

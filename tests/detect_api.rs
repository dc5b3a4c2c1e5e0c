//! HTTP tests for the detection service router.

use std::io::Cursor;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::http::{header, HeaderValue, StatusCode};
use axum_test::multipart::{MultipartForm, Part};
use axum_test::TestServer;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use serde_json::Value;

use busload::api::router;
use busload::detection::{
    AlertDispatcher, AlertSink, DetectionService, ImageValidator, InferenceError, OccupancyReport,
    PersonCounter,
};
use busload::error::TransportError;

struct FixedCounter(u32);

impl PersonCounter for FixedCounter {
    fn count_people(&self, _image: &DynamicImage) -> Result<u32, InferenceError> {
        Ok(self.0)
    }
}

struct BrokenCounter;

impl PersonCounter for BrokenCounter {
    fn count_people(&self, _image: &DynamicImage) -> Result<u32, InferenceError> {
        Err(InferenceError("model crashed".to_string()))
    }
}

#[derive(Default)]
struct RecordingSink {
    reports: Mutex<Vec<OccupancyReport>>,
    warnings: Mutex<Vec<OccupancyReport>>,
}

#[async_trait]
impl AlertSink for RecordingSink {
    async fn report(&self, report: &OccupancyReport) -> Result<(), TransportError> {
        self.reports.lock().unwrap().push(report.clone());
        Ok(())
    }

    async fn warn(&self, report: &OccupancyReport) -> Result<(), TransportError> {
        self.warnings.lock().unwrap().push(report.clone());
        Ok(())
    }
}

fn create_test_server(counter: Arc<dyn PersonCounter>, sink: Arc<RecordingSink>) -> TestServer {
    let service = DetectionService::new(
        ImageValidator::default(),
        counter,
        AlertDispatcher::new(sink),
        40,
    );
    TestServer::new(router(service)).unwrap()
}

fn jpeg(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 128]));
    let mut out = Vec::new();
    img.write_to(&mut Cursor::new(&mut out), ImageFormat::Jpeg)
        .unwrap();
    out
}

fn image_form(bytes: Vec<u8>) -> MultipartForm {
    let part = Part::bytes(bytes)
        .file_name("bus-1.jpg")
        .mime_type("image/jpeg");
    MultipartForm::new().add_part("image", part)
}

#[tokio::test]
async fn test_health_endpoint() {
    let server = create_test_server(Arc::new(FixedCounter(0)), Arc::default());

    let response = server.get("/health").await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_detect_returns_occupancy() {
    let sink = Arc::new(RecordingSink::default());
    let server = create_test_server(Arc::new(FixedCounter(17)), sink.clone());

    let response = server
        .post("/detect")
        .add_query_param("camera_id", "bus-1")
        .multipart(image_form(jpeg(32, 32)))
        .await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["camera_id"], "bus-1");
    assert_eq!(body["occupancy"], 17);
    assert_eq!(body["capacity"], 40);
    assert_eq!(body["status"], "success");
    assert_eq!(sink.reports.lock().unwrap().len(), 1);
    assert!(sink.warnings.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_detect_over_capacity_sends_warning() {
    let sink = Arc::new(RecordingSink::default());
    let server = create_test_server(Arc::new(FixedCounter(44)), sink.clone());

    let response = server
        .post("/detect")
        .add_query_param("camera_id", "bus-4")
        .multipart(image_form(jpeg(16, 16)))
        .await;

    response.assert_status_ok();
    let warnings = sink.warnings.lock().unwrap();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].camera_id, "bus-4");
    assert_eq!(warnings[0].occupancy, 44);
}

#[tokio::test]
async fn test_detect_rejects_oversized_image() {
    let sink = Arc::new(RecordingSink::default());
    let server = create_test_server(Arc::new(FixedCounter(1)), sink.clone());

    let response = server
        .post("/detect")
        .add_query_param("camera_id", "bus-1")
        .multipart(image_form(vec![0u8; 6 * 1024 * 1024]))
        .await;

    response.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert!(body["detail"].as_str().unwrap().contains("5MB"));
    assert!(sink.reports.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_detect_rejects_image_beyond_body_limit() {
    let sink = Arc::new(RecordingSink::default());
    let server = create_test_server(Arc::new(FixedCounter(1)), sink.clone());

    let response = server
        .post("/detect")
        .add_query_param("camera_id", "bus-1")
        .multipart(image_form(vec![0u8; 12 * 1024 * 1024]))
        .await;

    response.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["detail"], "image size exceeds 5MB limit");
    assert!(sink.reports.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_detect_rejects_undecodable_image() {
    let server = create_test_server(Arc::new(FixedCounter(1)), Arc::default());

    let response = server
        .post("/detect")
        .add_query_param("camera_id", "bus-1")
        .multipart(image_form(b"definitely not an image".to_vec()))
        .await;

    response.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert!(body["detail"].is_string());
}

#[tokio::test]
async fn test_detect_inference_failure_is_server_error() {
    let sink = Arc::new(RecordingSink::default());
    let server = create_test_server(Arc::new(BrokenCounter), sink.clone());

    let response = server
        .post("/detect")
        .add_query_param("camera_id", "bus-1")
        .multipart(image_form(jpeg(16, 16)))
        .await;

    response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = response.json();
    assert!(body["detail"].as_str().unwrap().contains("model crashed"));
    assert!(sink.reports.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_detect_requires_camera_id() {
    let server = create_test_server(Arc::new(FixedCounter(1)), Arc::default());

    let response = server
        .post("/detect")
        .multipart(image_form(jpeg(16, 16)))
        .await;

    response.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_detect_requires_image_field() {
    let server = create_test_server(Arc::new(FixedCounter(1)), Arc::default());

    let form = MultipartForm::new().add_text("note", "no image here");
    let response = server
        .post("/detect")
        .add_query_param("camera_id", "bus-1")
        .multipart(form)
        .await;

    response.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["detail"], "image field is required");
}

#[tokio::test]
async fn test_cross_origin_requests_are_allowed() {
    let server = create_test_server(Arc::new(FixedCounter(0)), Arc::default());

    let response = server
        .get("/health")
        .add_header(header::ORIGIN, HeaderValue::from_static("http://dashboard.local"))
        .await;

    response.assert_status_ok();
    assert_eq!(response.header("access-control-allow-origin"), "*");
}

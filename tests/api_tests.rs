mod common;

use actix_web::{App, test, web};
use hwmux::frame::{CONTROLLER_CHANNELS, encode_controller_frame};
use hwmux::routes::AppState;
use serde_json::Value;

use common::mock_dispatcher;

macro_rules! init_app {
    ($state:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::new($state.clone()))
                .service($state.api_scope("/api/v1")),
        )
        .await
    };
}

#[actix_rt::test]
async fn list_resources_returns_all() {
    let (dispatcher, _backend) = mock_dispatcher();
    let state = AppState { dispatcher };
    let app = init_app!(state);

    let req = test::TestRequest::get().uri("/api/v1/resources").to_request();
    let response: Vec<Value> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(response.len(), 9);

    let led = &response[0];
    assert_eq!(led["resource"]["pin"], 1);
    assert_eq!(led["name"], "LED 1");
    assert_eq!(led["active"], false);
    assert_eq!(led["degraded"], false);
    assert!(response.iter().any(|r| r["resource"]["serial"] == "remote"));
    assert!(response.iter().any(|r| r["resource"]["pwm"] == "servo"));
}

#[actix_rt::test]
async fn pin_not_found_returns_404() {
    let (dispatcher, _backend) = mock_dispatcher();
    let state = AppState { dispatcher };
    let app = init_app!(state);

    let req = test::TestRequest::get()
        .uri("/api/v1/gpio/999/value")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);

    let req = test::TestRequest::get()
        .uri("/api/v1/serial/nope/state")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
}

#[actix_rt::test]
async fn wrong_method_returns_405() {
    let (dispatcher, _backend) = mock_dispatcher();
    let state = AppState { dispatcher };
    let app = init_app!(state);

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/1/state")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 405);

    let req = test::TestRequest::delete()
        .uri("/api/v1/serial/uart0/data")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 405);

    let req = test::TestRequest::get()
        .uri("/api/v1/pwm/servo/angle")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 405);
}

#[actix_rt::test]
async fn set_state_and_value_happy_path() {
    let (dispatcher, backend) = mock_dispatcher();
    let state = AppState { dispatcher };
    let app = init_app!(state);

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/1/settings")
        .set_payload(r#"{"state":"push-pull"}"#)
        .to_request();
    let settings: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(settings["state"], "push-pull");

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/1/value")
        .set_payload("1")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    assert_eq!(backend.pin_value(1), Some(1));

    let req = test::TestRequest::get()
        .uri("/api/v1/gpio/1/value")
        .to_request();
    let outcome: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(outcome["value"]["digital"], 1);

    let req = test::TestRequest::get()
        .uri("/api/v1/gpio/1/state")
        .to_request();
    let cached: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(cached["value"]["digital"], 1);
    assert_eq!(cached["settling"], false);
}

#[actix_rt::test]
async fn reject_value_when_not_output() {
    let (dispatcher, _backend) = mock_dispatcher();
    let state = AppState { dispatcher };
    let app = init_app!(state);

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/2/value")
        .set_payload("1")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/1/value")
        .set_payload("7")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
}

#[actix_rt::test]
async fn reject_unsupported_state() {
    let (dispatcher, _backend) = mock_dispatcher();
    let state = AppState { dispatcher };
    let app = init_app!(state);

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/1/settings")
        .set_payload(r#"{"state":"pull-up"}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);

    let body: Value = test::read_body_json(resp).await;
    assert!(
        body["error"]
            .as_str()
            .is_some_and(|e| e.contains("State not supported by pin 1"))
    );
}

#[actix_rt::test]
async fn input_read_is_recorded_as_event() {
    let (dispatcher, backend) = mock_dispatcher();
    let state = AppState { dispatcher };
    let app = init_app!(state);

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/2/settings")
        .set_payload(r#"{"state":"pull-up"}"#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    backend.set_input(2, 1);
    let req = test::TestRequest::get()
        .uri("/api/v1/gpio/2/value")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let req = test::TestRequest::get()
        .uri("/api/v1/gpio/2/events")
        .to_request();
    let events: Vec<Value> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["kind"], "changed");
    assert_eq!(events[0]["value"]["digital"], 1);

    let req = test::TestRequest::get()
        .uri("/api/v1/gpio/2/event")
        .to_request();
    let last: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(last["resource"]["pin"], 2);
}

#[actix_rt::test]
async fn serial_write_and_frame_read() {
    let (dispatcher, backend) = mock_dispatcher();
    let state = AppState { dispatcher };
    let app = init_app!(state);

    let req = test::TestRequest::post()
        .uri("/api/v1/serial/uart0/data")
        .set_payload("hello")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    assert_eq!(backend.serial_output("uart0"), b"hello");

    let mut channels = [1500u16; CONTROLLER_CHANNELS];
    channels[0] = 1000;
    backend.push_serial_input("remote", &encode_controller_frame(&channels));

    let req = test::TestRequest::get()
        .uri("/api/v1/serial/remote/frame")
        .to_request();
    let outcome: Value = test::call_and_read_body_json(&app, req).await;
    let decoded = outcome["value"]["channels"]
        .as_array()
        .expect("channel list");
    assert_eq!(decoded.len(), CONTROLLER_CHANNELS);
    assert_eq!(decoded[0], 1000);
    assert_eq!(decoded[13], 1500);

    // Raw serials have no frame decoder.
    let req = test::TestRequest::get()
        .uri("/api/v1/serial/uart0/frame")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
}

#[actix_rt::test]
async fn serial_read_length_is_bounded() {
    let (dispatcher, backend) = mock_dispatcher();
    let state = AppState { dispatcher };
    let app = init_app!(state);

    let req = test::TestRequest::get()
        .uri("/api/v1/serial/uart0/data?max_len=18446744073709551615")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);

    // Without max_len the configured bound is used.
    backend.push_serial_input("uart0", b"hello");
    let req = test::TestRequest::get()
        .uri("/api/v1/serial/uart0/data")
        .to_request();
    let outcome: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(outcome["value"]["bytes"].as_array().map(Vec::len), Some(5));
    assert_eq!(backend.calls()[1].call, "read 4096");
}

#[actix_rt::test]
async fn pwm_settings_duty_and_angle() {
    let (dispatcher, backend) = mock_dispatcher();
    let state = AppState { dispatcher };
    let app = init_app!(state);

    let req = test::TestRequest::post()
        .uri("/api/v1/pwm/servo/settings")
        .set_payload(r#"{"frequency_hz":50,"enabled":true}"#)
        .to_request();
    let settings: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(settings["frequency_hz"], 50);
    assert_eq!(settings["enabled"], true);

    let req = test::TestRequest::post()
        .uri("/api/v1/pwm/servo/angle")
        .set_payload("0")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    assert_eq!(backend.pwm_duty("servo"), Some(0.05));

    let req = test::TestRequest::post()
        .uri("/api/v1/pwm/servo/duty")
        .set_payload("0.25")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let req = test::TestRequest::get()
        .uri("/api/v1/pwm/servo/duty")
        .to_request();
    let outcome: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(outcome["value"]["analog"], 0.25);

    for (uri, payload) in [
        ("/api/v1/pwm/servo/duty", "fast"),
        ("/api/v1/pwm/servo/duty", "2"),
        ("/api/v1/pwm/servo/angle", "270"),
        ("/api/v1/pwm/fan/angle", "10"),
    ] {
        let req = test::TestRequest::post()
            .uri(uri)
            .set_payload(payload)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 400, "{uri} {payload}");
    }

    let req = test::TestRequest::get()
        .uri("/api/v1/pwm/nope/duty")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
}

#[actix_rt::test]
async fn serial_settings_change_baud_rate() {
    let (dispatcher, backend) = mock_dispatcher();
    let state = AppState { dispatcher };
    let app = init_app!(state);

    let req = test::TestRequest::post()
        .uri("/api/v1/serial/uart0/settings")
        .set_payload(r#"{"baud_rate":9600}"#)
        .to_request();
    let settings: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(settings["baud_rate"], 9600);
    assert_eq!(backend.serial_baud_rate("uart0"), Some(9600));
}

#[actix_rt::test]
async fn requests_after_shutdown_return_503() {
    let (dispatcher, _backend) = mock_dispatcher();
    let state = AppState {
        dispatcher: dispatcher.clone(),
    };
    let app = init_app!(state);

    dispatcher.shutdown();

    let req = test::TestRequest::get()
        .uri("/api/v1/gpio/1/value")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 503);
}

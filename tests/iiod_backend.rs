//! Integration tests for the IIO daemon backend
//!
//! A small in-process daemon answers the PRINT / READ / WRITE subset of the
//! text protocol over a real TCP socket, so the client, device discovery and
//! the whole production test run over the network path.

use std::collections::HashMap;
use std::future::pending;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cn0508_production_test::calibration::{dac_code_for_setpoint, ScaleTable};
use cn0508_production_test::config::TestConfig;
use cn0508_production_test::hardware::iiod::{IiodClient, MAX_REPLY_BYTES};
use cn0508_production_test::hardware::{AnalogInput, AnalogOutput, Instrument, InstrumentUri};
use cn0508_production_test::operator::ScriptedOperator;
use cn0508_production_test::procedures::{self, RunOutcome};
use cn0508_production_test::TestError;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

const DAC_SCALE: &str = "0.038146972";

/// Attribute store and write log shared with the fake daemon.
#[derive(Clone, Default)]
struct DaemonState {
    attrs: Arc<Mutex<HashMap<String, String>>>,
    writes: Arc<Mutex<Vec<(String, String)>>>,
}

impl DaemonState {
    fn set(&self, key: &str, value: &str) {
        self.attrs
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }

    fn writes_to(&self, key: &str) -> Vec<String> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .collect()
    }
}

fn adc_channel(index: usize) -> String {
    format!("voltage{index}-voltage19")
}

fn context_xml() -> String {
    let mut xml = String::from(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<context name=\"network\" >\n\
         <device id=\"iio:device0\" name=\"ad5683r\" >\n\
         <channel id=\"voltage0\" type=\"output\" >\n\
         <attribute name=\"raw\" filename=\"out_voltage0_raw\" />\n\
         <attribute name=\"scale\" filename=\"out_voltage0_scale\" />\n\
         </channel>\n</device>\n\
         <device id=\"iio:device1\" name=\"ad7124-4\" >\n",
    );
    for index in 0..8 {
        xml.push_str(&format!(
            "<channel id=\"{}\" type=\"input\" >\n\
             <attribute name=\"raw\" />\n<attribute name=\"scale\" />\n</channel>\n",
            adc_channel(index)
        ));
    }
    xml.push_str("<channel id=\"timestamp\" type=\"input\" ></channel>\n</device>\n</context>");
    xml
}

/// State for a board that passes every check.
fn passing_board() -> DaemonState {
    let state = DaemonState::default();
    state.set("iio:device0 OUTPUT voltage0 scale", DAC_SCALE);
    let raws = [
        167_773,    // 25 degC
        167_773,    // 25 degC
        2_013_271,  // 1.5 A
        11_239_493, // 24 V
        0,          // 0 V
        8_388_643,  // 50 %
        8_388_643,  // 50 %
        0,
    ];
    for (index, raw) in raws.iter().enumerate() {
        state.set(
            &format!("iio:device1 INPUT {} raw", adc_channel(index)),
            &raw.to_string(),
        );
    }
    state
}

/// Serve one client connection on an ephemeral port.
async fn spawn_daemon(state: DaemonState) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let xml = context_xml();

    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut stream = BufReader::new(socket);
        let mut line = String::new();

        loop {
            line.clear();
            if stream.read_line(&mut line).await.unwrap_or(0) == 0 {
                break;
            }
            let words: Vec<String> = line.split_whitespace().map(str::to_string).collect();

            let reply = match words.first().map(String::as_str) {
                Some("PRINT") => format!("{}\n{}\n", xml.len(), xml),
                Some("READ") if words.len() == 5 => {
                    let key = words[1..].join(" ");
                    let value = state.attrs.lock().unwrap().get(&key).cloned();
                    match value {
                        Some(v) => format!("{}\n{}\n", v.len(), v),
                        None => "-22\n".to_string(),
                    }
                }
                Some("WRITE") if words.len() == 6 => {
                    let len: usize = words[5].parse().unwrap();
                    let mut data = vec![0u8; len];
                    stream.read_exact(&mut data).await.unwrap();
                    let key = words[1..5].join(" ");
                    let value = String::from_utf8(data).unwrap();
                    if words[4] == "readonly" {
                        "-13\n".to_string()
                    } else {
                        state.writes.lock().unwrap().push((key.clone(), value.clone()));
                        state.attrs.lock().unwrap().insert(key, value);
                        format!("{len}\n")
                    }
                }
                _ => "-22\n".to_string(),
            };

            if stream.get_mut().write_all(reply.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    port
}

fn config_for(port: u16) -> TestConfig {
    let mut config = TestConfig::default();
    config.instrument.uri = format!("ip:127.0.0.1:{port}");
    config.instrument.timeout_ms = 2000;
    config.timing.dac_settle_ms = 0;
    config.timing.load_settle_ms = 0;
    // A pot out of range fails the run instead of waiting on the operator
    config.pot_gate.max_prompts = Some(0);
    config
}

// =============================================================================
// Client
// =============================================================================

#[tokio::test]
async fn test_client_reads_and_writes_attributes() {
    let state = passing_board();
    let port = spawn_daemon(state.clone()).await;
    let client = IiodClient::connect("127.0.0.1", port, Duration::from_secs(2))
        .await
        .unwrap();

    let scale = client
        .read_channel_attr("iio:device0", "voltage0", true, "scale")
        .await
        .unwrap();
    assert_eq!(scale, DAC_SCALE);

    client
        .write_channel_attr("iio:device0", "voltage0", true, "raw", "11000")
        .await
        .unwrap();
    assert_eq!(state.writes_to("iio:device0 OUTPUT voltage0 raw"), vec!["11000"]);
}

#[tokio::test]
async fn test_client_reports_errno_replies() {
    let port = spawn_daemon(passing_board()).await;
    let client = IiodClient::connect("127.0.0.1", port, Duration::from_secs(2))
        .await
        .unwrap();

    let err = client
        .read_channel_attr("iio:device1", "voltage0-voltage19", false, "nonexistent")
        .await
        .unwrap_err();
    assert!(matches!(err, TestError::Remote { errno: 22, .. }));

    let err = client
        .write_channel_attr("iio:device0", "voltage0", true, "readonly", "1")
        .await
        .unwrap_err();
    assert!(matches!(err, TestError::Remote { errno: 13, .. }));

    // The session stays usable after an error reply
    let scale = client
        .read_channel_attr("iio:device0", "voltage0", true, "scale")
        .await
        .unwrap();
    assert_eq!(scale, DAC_SCALE);
}

#[tokio::test]
async fn test_client_reads_empty_attribute() {
    let state = passing_board();
    state.set("iio:device0 OUTPUT voltage0 label", "");
    let port = spawn_daemon(state).await;
    let client = IiodClient::connect("127.0.0.1", port, Duration::from_secs(2))
        .await
        .unwrap();

    // Back to back, so the empty block's newline is still in flight
    for _ in 0..3 {
        let label = client
            .read_channel_attr("iio:device0", "voltage0", true, "label")
            .await
            .unwrap();
        assert_eq!(label, "");
        let scale = client
            .read_channel_attr("iio:device0", "voltage0", true, "scale")
            .await
            .unwrap();
        assert_eq!(scale, DAC_SCALE);
    }
}

#[tokio::test]
async fn test_client_rejects_oversized_reply() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut stream = BufReader::new(socket);
        let mut line = String::new();
        stream.read_line(&mut line).await.unwrap();
        let announced = MAX_REPLY_BYTES + 1;
        stream
            .get_mut()
            .write_all(format!("{announced}\n").as_bytes())
            .await
            .unwrap();
        pending::<()>().await;
    });

    let client = IiodClient::connect("127.0.0.1", port, Duration::from_secs(2))
        .await
        .unwrap();
    let err = client.context().await.unwrap_err();
    assert!(matches!(err, TestError::Protocol(_)), "got {err}");
}

#[tokio::test]
async fn test_client_discovers_context() {
    let port = spawn_daemon(passing_board()).await;
    let client = IiodClient::connect("127.0.0.1", port, Duration::from_secs(2))
        .await
        .unwrap();

    let context = client.context().await.unwrap();
    let adc = context.device("ad7124-4").unwrap();
    assert_eq!(adc.id, "iio:device1");
    assert_eq!(adc.channels.len(), 9);
    assert_eq!(context.device("ad5683r").unwrap().id, "iio:device0");
}

#[tokio::test]
async fn test_silent_daemon_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (_socket, _) = listener.accept().await.unwrap();
        pending::<()>().await;
    });

    let client = IiodClient::connect("127.0.0.1", port, Duration::from_millis(100))
        .await
        .unwrap();
    let err = client.context().await.unwrap_err();
    assert!(matches!(err, TestError::Timeout { timeout_ms: 100, .. }));
}

// =============================================================================
// Instrument
// =============================================================================

#[tokio::test]
async fn test_connect_binds_adc_and_dac() {
    let port = spawn_daemon(passing_board()).await;
    let config = config_for(port);
    assert!(matches!(
        config.instrument.uri.parse::<InstrumentUri>(),
        Ok(InstrumentUri::Network { .. })
    ));

    let instrument = Instrument::connect(&config.instrument).await.unwrap();
    assert_eq!(instrument.adc().name(), "ad7124-4");
    assert_eq!(instrument.adc().channel_count(), 8);
    assert_eq!(instrument.adc().read_raw(2).await.unwrap(), 2_013_271);
    assert!((instrument.dac().scale().await.unwrap() - 0.038146972).abs() < 1e-12);
    instrument.close().await;
}

#[tokio::test]
async fn test_connect_fails_without_dac() {
    let port = spawn_daemon(passing_board()).await;
    let mut config = config_for(port);
    config.instrument.dac_part = "ad5686".to_string();

    let err = Instrument::connect(&config.instrument).await.err().unwrap();
    assert!(matches!(err, TestError::DeviceNotFound(ref part) if part == "ad5686"));
}

#[tokio::test]
async fn test_full_run_over_network() {
    let state = passing_board();
    let port = spawn_daemon(state.clone()).await;
    let mut operator = ScriptedOperator::new();

    let outcome = procedures::run(&config_for(port), &ScaleTable::cn0508(), &mut operator, pending())
        .await
        .unwrap();

    let RunOutcome::Completed(report) = outcome else {
        panic!("expected a completed run");
    };
    assert!(report.passed(), "failures: {:?}", report.failures);
    assert_eq!(report.pot_reprompts, 0);
    assert!((report.initial_conditions.output_current - 1.5).abs() < 0.01);
    assert!((report.initial_conditions.vout_pot_position - 50.0).abs() < 0.01);

    let or_code = dac_code_for_setpoint(18.0, 0.038146972).to_string();
    assert_eq!(
        state.writes_to("iio:device0 OUTPUT voltage0 raw"),
        vec!["11000".to_string(), "0".to_string(), or_code, "0".to_string()]
    );
    for index in 0..8 {
        let channel = adc_channel(index);
        assert_eq!(
            state.writes_to(&format!("iio:device1 INPUT {channel} scale")),
            vec!["0.000149011"]
        );
        assert_eq!(
            state.writes_to(&format!("iio:device1 INPUT {channel} sampling_frequency")),
            vec!["9600"]
        );
    }
}

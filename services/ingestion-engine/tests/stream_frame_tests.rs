use services_common::types::StreamFrame;

#[test]
fn decodes_heartbeat_frame() {
    let line = r#"{"Heartbeat": 12, "Timestamp": "2024-02-05T14:30:00Z"}"#;
    let frame: StreamFrame = serde_json::from_str(line).unwrap();
    match frame {
        StreamFrame::Heartbeat(hb) => assert_eq!(hb.heartbeat, 12),
        StreamFrame::Quote(_) => panic!("expected heartbeat"),
    }
}

#[test]
fn decodes_quote_frame() {
    let line = r#"{
        "Legs": [{"Symbol": "SPY240205C600", "StrikePrice": 600.0, "OptionType": "Call", "Expiration": "2024-02-05T00:00:00Z"}],
        "Bid": 1.0, "Ask": 1.2, "Mid": 1.1, "Last": 1.15,
        "Volume": 42, "DailyOpenInterest": 500, "ImpliedVolatility": 0.15,
        "Delta": 0.5, "Gamma": 0.02, "Theta": -0.1, "Vega": 0.3, "Rho": 0.05
    }"#;
    let frame: StreamFrame = serde_json::from_str(line).unwrap();
    match frame {
        StreamFrame::Quote(q) => {
            assert_eq!(q.legs[0].strike_price, 600.0);
            assert_eq!(q.volume, 42);
        }
        StreamFrame::Heartbeat(_) => panic!("expected quote"),
    }
}

#[test]
fn malformed_line_fails_to_parse_without_panicking() {
    let line = "{not json";
    let result: Result<StreamFrame, _> = serde_json::from_str(line);
    assert!(result.is_err());
}

// Scripted reader sessions for `--mock`.
//
// Each script answers the configuration sequence of its dialect and then a
// fixed number of inventories, so the CLI wiring can be smoke-tested
// without hardware.

use rfidlib::ascii::AsciiModel;
use rfidlib::at::AtModel;
use rfidlib_test_harness::{MockConnector, MockTransport};

/// How many inventories a mock session answers after configuration.
pub const MOCK_INVENTORIES: usize = 16;

fn at_ok(mock: &mut MockTransport, command: &str, lines: &[&str]) {
    let mut reply = format!("{command}\r\n");
    for line in lines {
        reply.push_str(line);
        reply.push_str("\r\n");
    }
    reply.push_str("OK\r\n");
    mock.expect(format!("{command}\r").as_bytes(), reply.as_bytes());
}

fn at_error(mock: &mut MockTransport, command: &str, message: &str) {
    let reply = format!("{command}\r\n{message}\r\nERROR\r\n");
    mock.expect(format!("{command}\r").as_bytes(), reply.as_bytes());
}

/// A UHF reader reporting two tags on antenna 1.
pub fn at_uhf(model: &AtModel) -> MockConnector {
    let name = model.expected.hardware_name;
    let mut mock = MockTransport::new();
    mock.expect(b"ATE1\r", b"OK\r\n");
    at_error(&mut mock, "AT+BINV", "+BINV: <is not running>");
    at_error(&mut mock, "AT+BINVR", "+BINVR: <is not running>");
    at_ok(&mut mock, "AT+INVS?", &["+INVS: 0,1,0"]);
    at_ok(
        &mut mock,
        "ATI",
        &[
            &format!("+SW: {name} 0104"),
            &format!("+HW: {name} 0100"),
            "+SERIAL: 2020090817420000",
        ],
    );
    at_ok(&mut mock, "AT+ANT?", &["+ANT: 1"]);
    at_ok(&mut mock, "AT+HBT=0", &[]);
    at_ok(&mut mock, "AT+IEV=0", &[]);
    for _ in 0..MOCK_INVENTORIES {
        at_ok(
            &mut mock,
            "AT+INV",
            &[
                "+INV: 3034257BF468D480000003EB,-55",
                "+INV: 3034257BF468D480000003EC,-61",
                "+INV: <ROUND FINISHED, ANT=1>",
            ],
        );
    }
    MockConnector::with(mock)
}

fn ascii_reply(mock: &mut MockTransport, command: &str, reply: &str) {
    mock.expect(
        format!("{command}\r").as_bytes(),
        format!("{reply}\r\n").as_bytes(),
    );
}

/// An HF reader reporting one ISO 15693 tag on antenna 1.
pub fn ascii_hf(model: &AsciiModel) -> MockConnector {
    let name = model.expected.hardware_name;
    let version = model.expected.min_firmware;
    let mut mock = MockTransport::new();
    mock.expect(b"BRK\r", b"NCM\r");
    ascii_reply(&mut mock, "EOF", "OK!");
    ascii_reply(&mut mock, "HWR", &format!("{name}       0200"));
    ascii_reply(
        &mut mock,
        "RFW",
        &format!("{name}       {:02}{:02}", version.major, version.minor),
    );
    ascii_reply(&mut mock, "SRI SS 100", "OK!");
    ascii_reply(&mut mock, "HBT 0", "OK!");
    for _ in 0..MOCK_INVENTORIES {
        ascii_reply(&mut mock, "INV", "E0040150954F02B1\rARP 01\rIVF 01\r");
    }
    MockConnector::with(mock)
}

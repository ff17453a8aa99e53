//! The legacy ASCII dialect: command exchange, wake-up handshake and line
//! demultiplexing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use rfidlib_core::config::{AntennaMode, ExpectedReader, ReaderIdentity};
use rfidlib_core::error::{Error, Result};
use rfidlib_core::tag::Tag;
use rfidlib_engine::framing::{CR, LF};
use rfidlib_engine::{CommandParam, Dialect, Exchange, Session, render_params};

use crate::protocol::{self, Line, TERMINATOR, TagResponse};

/// How long the handshake waits for each answer.
const HANDSHAKE_POLL: Duration = Duration::from_millis(500);

/// How long the handshake tolerates answers it cannot use.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// Wake-up attempts before a silent device is given up on.
const MAX_WAKE_ATTEMPTS: u32 = 4;

/// Called with the data of every successful tag request.
pub type RequestCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Sub-carrier mode of the RF interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubCarrier {
    #[default]
    Single,
    Double,
}

/// Options sent with every inventory command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InventoryOptions {
    /// Only look for a single transponder. Faster, but more than one
    /// transponder in the field is an error.
    pub single_slot: bool,
    /// Report each transponder only once while it stays powered in the
    /// field.
    pub only_new_tags: bool,
    /// Only transponders of this application family answer.
    pub afi: Option<u8>,
}

impl InventoryOptions {
    /// Command parameters: `[SSL] [ONT] [AFI xx]`.
    pub(crate) fn params(&self) -> [Option<String>; 3] {
        [
            self.single_slot.then(|| "SSL".to_string()),
            self.only_new_tags.then(|| "ONT".to_string()),
            self.afi.filter(|a| *a != 0).map(|a| format!("AFI {a:02X}")),
        ]
    }
}

#[derive(Debug)]
struct AsciiState {
    rfi_enabled: bool,
    sub_carrier: SubCarrier,
    modulation_depth: u8,
    /// `CNR INV` is running; the reader answers nothing but `BRK`.
    continuous: bool,
    options: InventoryOptions,
}

impl Default for AsciiState {
    fn default() -> Self {
        Self {
            rfi_enabled: false,
            sub_carrier: SubCarrier::Single,
            modulation_depth: 100,
            continuous: false,
            options: InventoryOptions::default(),
        }
    }
}

#[derive(Default)]
struct Pending {
    inventory: Option<oneshot::Sender<Vec<Tag>>>,
    request: Option<oneshot::Sender<TagResponse>>,
}

/// Legacy ASCII dialect for one reader connection.
pub struct AsciiDialect {
    expected: Option<ExpectedReader>,
    state: Mutex<AsciiState>,
    pending: Mutex<Pending>,
    request_callback: Mutex<Option<RequestCallback>>,
}

impl AsciiDialect {
    /// `expected` is checked against the identity the reader reports during
    /// configuration; `None` accepts any device.
    pub fn new(expected: Option<ExpectedReader>) -> Self {
        Self {
            expected,
            state: Mutex::new(AsciiState::default()),
            pending: Mutex::new(Pending::default()),
            request_callback: Mutex::new(None),
        }
    }

    // -----------------------------------------------------------------------
    // Command exchange
    // -----------------------------------------------------------------------

    /// Take the command lock. The reader does not answer commands while a
    /// continuous inventory runs.
    async fn idle_exchange<'a>(&self, session: &'a Session) -> Result<Exchange<'a>> {
        let exchange = session.exchange().await;
        if self.is_continuous() {
            return Err(Error::Reader(
                "Continuous inventory is running, stop it first".into(),
            ));
        }
        Ok(exchange)
    }

    async fn send_line(exchange: &Exchange<'_>, wire: &str) -> Result<()> {
        trace!(instance = %exchange.session().instance(), cmd = %wire, "send");
        exchange.send(&format!("{wire}{TERMINATOR}")).await
    }

    /// Send a command and return its single reply line.
    pub async fn get_command(
        &self,
        session: &Session,
        name: &str,
        params: &[&dyn CommandParam],
    ) -> Result<String> {
        let wire = protocol::prepare_command(name, params);
        let mut exchange = self.idle_exchange(session).await?;
        Self::send_line(&exchange, &wire).await?;
        exchange.recv(session.command_timeout()).await.inspect_err(|_| {
            debug!(instance = %session.instance(), cmd = %wire, "no reader response");
        })
    }

    /// Send a command whose reply must contain `OK`.
    pub async fn set_command(
        &self,
        session: &Session,
        name: &str,
        params: &[&dyn CommandParam],
    ) -> Result<()> {
        let reply = self.get_command(session, name, params).await?;
        if protocol::is_ok(&reply) {
            return Ok(());
        }
        let params = render_params(params).join(" ");
        Err(Error::Reader(format!("{reply} - ({name} {params})")))
    }

    /// Send a command the reader does not answer directly.
    pub async fn send_command(
        &self,
        session: &Session,
        name: &str,
        params: &[&dyn CommandParam],
    ) -> Result<()> {
        let wire = protocol::prepare_command(name, params);
        let exchange = self.idle_exchange(session).await?;
        Self::send_line(&exchange, &wire).await
    }

    /// Send a command answered by an inventory group and wait for the
    /// group.
    pub async fn inventory_command(
        &self,
        session: &Session,
        name: &str,
        params: &[&dyn CommandParam],
    ) -> Result<Vec<Tag>> {
        let (tx, rx) = oneshot::channel();
        let wire = protocol::prepare_command(name, params);
        let exchange = self.idle_exchange(session).await?;
        self.pending.lock().inventory = Some(tx);
        let result = async {
            Self::send_line(&exchange, &wire).await?;
            self.await_group(session, rx).await
        }
        .await;
        self.pending.lock().inventory = None;
        result
    }

    /// Send a tag request and wait for its result group.
    pub async fn request_command(
        &self,
        session: &Session,
        name: &str,
        params: &[&dyn CommandParam],
    ) -> Result<TagResponse> {
        let (tx, rx) = oneshot::channel();
        let wire = protocol::prepare_command(name, params);
        let exchange = self.idle_exchange(session).await?;
        self.pending.lock().request = Some(tx);
        let result = async {
            Self::send_line(&exchange, &wire).await?;
            self.await_group(session, rx).await
        }
        .await;
        self.pending.lock().request = None;
        result
    }

    async fn await_group<T>(&self, session: &Session, rx: oneshot::Receiver<T>) -> Result<T> {
        match tokio::time::timeout(session.command_timeout(), rx).await {
            Ok(Ok(group)) => Ok(group),
            Ok(Err(_)) => Err(Error::NotConnected),
            Err(_) if self.rfi_enabled() => Err(Error::Timeout),
            Err(_) => Err(Error::Reader("RF interface not enabled".into())),
        }
    }

    // -----------------------------------------------------------------------
    // Parser state
    // -----------------------------------------------------------------------

    pub fn rfi_enabled(&self) -> bool {
        self.state.lock().rfi_enabled
    }

    pub(crate) fn set_rf_interface(&self, enabled: bool, sub_carrier: SubCarrier, depth: u8) {
        let mut state = self.state.lock();
        state.rfi_enabled = enabled;
        if enabled {
            state.sub_carrier = sub_carrier;
            state.modulation_depth = depth;
        }
    }

    pub fn sub_carrier(&self) -> SubCarrier {
        self.state.lock().sub_carrier
    }

    pub fn modulation_depth(&self) -> u8 {
        self.state.lock().modulation_depth
    }

    pub fn is_continuous(&self) -> bool {
        self.state.lock().continuous
    }

    pub(crate) fn set_continuous(&self, running: bool) {
        self.state.lock().continuous = running;
    }

    pub fn inventory_options(&self) -> InventoryOptions {
        self.state.lock().options
    }

    pub(crate) fn set_inventory_options(&self, options: InventoryOptions) {
        self.state.lock().options = options;
    }

    pub(crate) fn set_request_callback(
        &self,
        callback: Option<RequestCallback>,
    ) -> Option<RequestCallback> {
        std::mem::replace(&mut *self.request_callback.lock(), callback)
    }

    // -----------------------------------------------------------------------
    // Commands shared by configuration and the reader
    // -----------------------------------------------------------------------

    /// Stop a continuous inventory with `BRK`. `NCM` (not in continuous
    /// mode) counts as stopped.
    pub async fn stop_inventory(&self, session: &Session) -> Result<()> {
        let mut exchange = session.exchange().await;
        Self::send_line(&exchange, "BRK").await?;
        let reply = exchange.recv(session.command_timeout()).await?;
        self.set_continuous(false);
        if reply.contains("BRA") || reply.contains("NCM") {
            return Ok(());
        }
        Err(Error::Reader(format!("Inventory not stopped - ({reply})")))
    }

    /// Switch the RF interface on (`SRI SS 100`).
    pub async fn enable_rf_interface(
        &self,
        session: &Session,
        sub_carrier: SubCarrier,
        modulation_depth: u8,
    ) -> Result<()> {
        if modulation_depth != 10 && modulation_depth != 100 {
            return Err(Error::InvalidParameter(
                "Modulation depth must be 100 or 10".into(),
            ));
        }
        let carrier = match sub_carrier {
            SubCarrier::Single => "SS",
            SubCarrier::Double => "DS",
        };
        self.set_command(session, "SRI", &[&carrier, &modulation_depth])
            .await?;
        self.set_rf_interface(true, sub_carrier, modulation_depth);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Configuration
    // -----------------------------------------------------------------------

    /// Bring the reader into command mode: interrupt a running inventory,
    /// wake a sleeping reader and leave configuration mode.
    async fn handshake(&self, session: &Session) -> Result<()> {
        let mut exchange = session.exchange().await;
        Self::send_line(&exchange, "BRK").await?;
        let mut sleeping = false;
        let mut wake_attempts = 0;
        let mut deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        loop {
            let Some(reply) = exchange.next_line(HANDSHAKE_POLL).await else {
                wake_attempts += 1;
                if wake_attempts > MAX_WAKE_ATTEMPTS {
                    return Err(session.silence_error());
                }
                debug!(instance = %session.instance(), "no answer, waking reader");
                sleeping = true;
                Self::send_line(&exchange, "WAK").await?;
                deadline = Instant::now() + HANDSHAKE_TIMEOUT;
                continue;
            };
            // BRA: inventory interrupted, NCM: not in continuous mode,
            // GMO: good morning, DNS: did not sleep
            if ["BRA", "NCM", "GMO", "DNS"].iter().any(|t| reply.contains(t)) {
                return Ok(());
            }
            if reply.contains("CCE") {
                // Configuration mode: leave it with the matching code.
                let wire = if sleeping { "WAK 5E70" } else { "COF 4F5E" };
                Self::send_line(&exchange, wire).await?;
                deadline = Instant::now() + HANDSHAKE_TIMEOUT;
                continue;
            }
            if reply.contains("OK") {
                Self::send_line(&exchange, "BRK").await?;
                continue;
            }
            if reply.contains("HBT") {
                continue;
            }
            if Instant::now() > deadline {
                debug!(instance = %session.instance(), reply = %reply, "wrong reader answer");
                return Err(Error::Configuration("Wrong metratec device".into()));
            }
        }
    }

    /// Switch to `\n` framed replies.
    async fn enable_end_of_frame(&self, session: &Session) -> Result<()> {
        let mut exchange = session.exchange().await;
        session.set_separator(LF).await?;
        Self::send_line(&exchange, "EOF").await?;
        loop {
            let reply = exchange.recv(session.command_timeout()).await?;
            if protocol::is_ok(&reply) {
                return Ok(());
            }
            trace!(instance = %session.instance(), reply = %reply, "waiting for EOF acknowledgment");
        }
    }

    async fn read_identity(&self, session: &Session) -> Result<ReaderIdentity> {
        let hwr = self.get_command(session, "HWR", &[]).await?;
        if hwr.contains("UCO") {
            // unknown command: older firmware
            let rev = self.get_command(session, "REV", &[]).await?;
            return protocol::parse_rev(&rev);
        }
        let rfw = self.get_command(session, "RFW", &[]).await?;
        protocol::parse_hwr_rfw(&hwr, &rfw)
    }

    fn handle_inventory(&self, session: &Session, group: &str, timestamp: DateTime<Utc>) {
        let tags = protocol::parse_inventory(group, timestamp);
        trace!(instance = %session.instance(), count = tags.len(), "inventory group");
        let waiter = self.pending.lock().inventory.take();
        match waiter {
            Some(tx) => {
                let _ = tx.send(tags);
            }
            None => session.fire_inventory(tags, true),
        }
    }

    fn handle_request(&self, session: &Session, group: &str, timestamp: DateTime<Utc>) {
        let response = protocol::parse_request(group, timestamp);
        if !response.data.is_empty() {
            session.fire_request_data(&response.data);
            let callback = self.request_callback.lock().clone();
            if let Some(callback) = callback {
                callback(&response.data);
            }
        }
        let waiter = self.pending.lock().request.take();
        match waiter {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => debug!(instance = %session.instance(), group = ?group, "unrequested tag response"),
        }
    }
}

#[async_trait]
impl Dialect for AsciiDialect {
    fn initial_separator(&self) -> u8 {
        CR
    }

    fn route_config_line(&self, session: &Session, line: &str) {
        let line = line.trim_end_matches('\r');
        trace!(instance = %session.instance(), line = ?line, "recv (config)");
        if protocol::is_config_reply(line) {
            session.push_reply(line);
        }
    }

    fn route_line(&self, session: &Session, line: &str, timestamp: DateTime<Utc>) {
        let line = line.trim_end_matches('\r');
        trace!(instance = %session.instance(), line = ?line, "recv");
        match protocol::classify(line) {
            Line::Empty | Line::Heartbeat => {}
            Line::Request(group) => self.handle_request(session, group, timestamp),
            Line::Inventory(group) => self.handle_inventory(session, group, timestamp),
            Line::RegistersNotWritten => {
                warn!(instance = %session.instance(), "registers not written, RF interface is off");
                self.state.lock().rfi_enabled = false;
            }
            Line::SoftReset => {
                warn!(instance = %session.instance(), "reader reset");
            }
            Line::Reply(text) => session.push_reply(text),
        }
    }

    async fn configure(&self, session: &Session) -> Result<()> {
        session.set_separator(CR).await?;
        self.set_continuous(false);
        self.handshake(session).await?;
        self.enable_end_of_frame(session).await?;

        let identity = self.read_identity(session).await?;
        if let Some(expected) = &self.expected {
            expected.validate(&identity)?;
        }
        info!(
            instance = %session.instance(),
            hardware = %identity.hardware_name,
            firmware = %identity.firmware_name,
            version = ?identity.firmware_version,
            "reader identified"
        );
        session.update_config(|c| {
            c.identity = identity;
            c.antenna_mode = AntennaMode::Single;
            c.antenna = 0;
        });

        let (sub_carrier, depth) = {
            let state = self.state.lock();
            (state.sub_carrier, state.modulation_depth)
        };
        self.enable_rf_interface(session, sub_carrier, depth).await
    }

    async fn set_heartbeat(&self, session: &Session, seconds: u32) -> Result<()> {
        self.set_command(session, "HBT", &[&seconds]).await
    }

    async fn enable_input_events(&self, session: &Session, _enable: bool) -> Result<()> {
        let firmware = session.with_config(|c| c.identity.firmware_name.clone());
        Err(Error::Unsupported(format!(
            "Input events not available for {firmware}"
        )))
    }

    async fn stop_activity(&self, session: &Session) -> Result<()> {
        if !self.is_continuous() {
            return Ok(());
        }
        self.stop_inventory(session).await
    }
}

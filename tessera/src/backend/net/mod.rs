/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The point-to-point backend: a line-oriented TCP protocol with
//! home-process bootstrap, a peer table, credit-based flow control and
//! elastic resize.
//!
//! One process per world is *home*: the process that managed to bind
//! the configured home port. Everyone else opens a listening socket on
//! an OS-chosen port and registers with home, which assigns
//! location-IDs and broadcasts the peer table. Data moves directly
//! between peers over lazily-dialed connections; a receiver grants
//! per-transfer credit (`allowsend`) before the sender may emit
//! `data` lines, which removes deadlock concerns for arbitrary
//! transition topologies and lets the receiver apply reductions in
//! place as elements arrive.
//!
//! The backend is single-threaded and cooperative: all entry points
//! block on an internal current-thread runtime whose event loop
//! multiplexes the listening socket and every peer connection.
//! Suspension happens only inside backend calls; applications never
//! observe re-entrancy.

pub mod peer;
pub mod wire;

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use bytes::BytesMut;
use ndspan::Slice;
use ndspan::next_lex;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::net::TcpSocket;
use tokio::net::TcpStream;

use crate::backend::Backend;
use crate::backend::ExecCtx;
use crate::backend::Transfer;
use crate::backend::sweep_order;
use crate::config::Config;
use crate::error::Error;
use crate::error::Result;
use crate::group::Group;
use crate::mapping::Mapping;
use crate::transition::ReduceEntry;
use crate::types::DataType;
use crate::types::ReduceOp;
use self::peer::MAX_PEERS;
use self::peer::Peer;
use self::peer::RecvState;
use self::wire::Command;

/// Initial per-connection receive buffer; grows up to [`RBUF_MAX`].
const RBUF_START: usize = 256;
/// A line longer than this is dropped as malformed.
const RBUF_MAX: usize = 64 * 1024;

/// Where arriving `data` elements deposit while a receive is pending.
struct Sink<'a> {
    dtype: &'a DataType,
    dims: usize,
    map: &'a mut Mapping,
}

struct Conn {
    stream: TcpStream,
    /// Location-ID of the peer on this connection, -1 until known.
    lid: i32,
    rbuf: BytesMut,
}

enum Event {
    Accept(std::io::Result<(TcpStream, SocketAddr)>),
    Readable(u64, std::io::Result<()>),
}

struct NetState {
    location: String,
    host: String,
    mylid: i32,
    listener: TcpListener,
    listen_port: u16,
    maxid: i32,
    phase: i32,
    peers: Vec<Peer>,
    conns: HashMap<u64, Conn>,
    next_conn_id: u64,
    /// Known peers other than this process (home's world-size gate).
    active_peers: usize,
    world: Option<Arc<Group>>,
    // resize negotiation state
    in_resize: bool,
    resize_done: bool,
    resize_reqs: HashMap<i32, bool>,
    resize_added: Vec<i32>,
}

/// The point-to-point TCP backend.
pub struct NetBackend {
    rt: tokio::runtime::Runtime,
    st: NetState,
}

impl NetBackend {
    /// Bootstrap per the membership protocol: become home by binding
    /// the configured home port, or register with home and wait for
    /// `phase 0`. Returns the backend and the world group.
    pub fn bootstrap(cfg: &Config, location: &str) -> Result<(NetBackend, Arc<Group>)> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()?;
        let st = rt.block_on(NetState::bootstrap(cfg, location))?;
        let world = st.world.clone().ok_or_else(|| {
            Error::logic("bootstrap finished without a world group".to_string())
        })?;
        Ok((NetBackend { rt, st }, world))
    }

    /// This process's location-ID.
    pub fn mylid(&self) -> i32 {
        self.st.mylid
    }

    /// The port this process listens on.
    pub fn listen_port(&self) -> u16 {
        self.st.listen_port
    }

    /// The current world group.
    pub fn world(&self) -> Arc<Group> {
        self.st
            .world
            .clone()
            .expect("world exists after bootstrap")
    }

    /// Location-IDs in the current peer table (including this
    /// process), ascending.
    pub fn peer_lids(&self) -> Vec<i32> {
        self.st.live_lids()
    }
}

impl Backend for NetBackend {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn finalize(&mut self) {
        self.st.conns.clear();
    }

    fn exec(
        &mut self,
        ctx: &mut ExecCtx<'_>,
        _plan: Option<&mut crate::backend::TransitionPlan>,
    ) -> Result<()> {
        let NetBackend { rt, st } = self;
        rt.block_on(st.exec_transition(ctx))
    }

    fn resize(&mut self, phase: i32, leave: bool) -> Result<Arc<Group>> {
        let NetBackend { rt, st } = self;
        rt.block_on(st.resize(phase, leave))
    }
}

impl NetState {
    async fn bootstrap(cfg: &Config, location: &str) -> Result<NetState> {
        let host = location.split(':').next().unwrap_or("localhost").to_string();
        let try_home = check_local(&cfg.home_host).await;
        let (listener, listen_port, is_home) = bind_listener(try_home, cfg.home_port).await?;
        tracing::debug!(
            location,
            listen_port,
            is_home,
            home = %cfg.home_host,
            "listening"
        );

        let mut peers: Vec<Peer> = (0..MAX_PEERS).map(|_| Peer::default()).collect();
        peers[0].host = if is_home {
            host.clone()
        } else {
            cfg.home_host.clone()
        };
        peers[0].port = Some(cfg.home_port);
        if is_home {
            peers[0].location = location.to_string();
        }

        let mut st = NetState {
            location: location.to_string(),
            host,
            mylid: if is_home { 0 } else { -1 },
            listener,
            listen_port,
            maxid: if is_home { 0 } else { -1 },
            phase: if is_home { 0 } else { -1 },
            peers,
            conns: HashMap::new(),
            next_conn_id: 0,
            active_peers: 0,
            world: None,
            in_resize: false,
            resize_done: false,
            resize_reqs: HashMap::new(),
            resize_added: Vec::new(),
        };

        if is_home {
            let world_size = cfg.world_size;
            if world_size > 1 {
                tracing::debug!(waiting = world_size - 1, "home: waiting for peers");
                st.run_until_idle(|s| s.active_peers + 1 >= world_size).await;
                for lid in 1..=st.maxid {
                    st.send_cmd(lid, &Command::Phase { phase: 0 }).await?;
                }
            }
        } else {
            let register = Command::Register {
                location: st.location.clone(),
                host: st.host.clone(),
                port: st.listen_port,
            };
            st.send_cmd(0, &register).await?;
            st.run_until_idle(|s| s.phase >= 0).await;
            if st.mylid < 0 {
                return Err(Error::logic(
                    "phase received before own location-ID".to_string(),
                ));
            }
        }

        // ranks are the live location-IDs in ascending order; for a
        // process joining at a later phase boundary these need not be
        // contiguous
        let locations = st.live_lids();
        let myid = locations
            .iter()
            .position(|&l| l == st.mylid)
            .map(|r| r as i32)
            .unwrap_or(-1);
        tracing::info!(
            mylid = st.mylid,
            world_size = locations.len(),
            listen_port = st.listen_port,
            "bootstrap complete"
        );
        st.world = Some(Group::world(locations, myid));
        Ok(st)
    }

    /// Location-IDs announced and not removed, ascending. All
    /// processes agree on this set at every phase boundary.
    fn live_lids(&self) -> Vec<i32> {
        (0..=self.maxid)
            .filter(|&lid| {
                let p = &self.peers[lid as usize];
                p.is_known() && !p.removed
            })
            .collect()
    }

    // -- event loop --------------------------------------------------

    async fn wait_event(&self) -> Event {
        let mut futs: Vec<Pin<Box<dyn Future<Output = Event> + '_>>> = Vec::new();
        futs.push(Box::pin(async {
            Event::Accept(self.listener.accept().await)
        }));
        for (&id, conn) in &self.conns {
            let stream = &conn.stream;
            futs.push(Box::pin(async move {
                Event::Readable(id, stream.readable().await)
            }));
        }
        futures::future::select_all(futs).await.0
    }

    async fn step(&mut self, sink: &mut Option<Sink<'_>>) -> Result<()> {
        match self.wait_event().await {
            Event::Accept(res) => {
                let (stream, addr) = res?;
                let id = self.add_conn(stream, -1);
                tracing::debug!(conn = id, %addr, "accepted connection");
                self.write_line(id, &Command::Comment("tessera here".to_string()))
                    .await?;
            }
            Event::Readable(id, res) => {
                res?;
                self.read_conn(id, sink).await?;
            }
        }
        Ok(())
    }

    /// Drive the event loop until `pred` holds.
    ///
    /// An error surfacing here is an asynchronous failure: a socket
    /// gone bad or a violated transfer invariant, with no caller in a
    /// position to recover. Per the error policy those are logged and
    /// terminate the process; non-fatal protocol violations never
    /// reach this point (the command handlers log and drop them).
    async fn run_until<F>(&mut self, pred: F, sink: &mut Option<Sink<'_>>)
    where
        F: Fn(&NetState) -> bool,
    {
        while !pred(self) {
            if let Err(err) = self.step(sink).await {
                tracing::error!(mylid = self.mylid, %err, "fatal error in event loop");
                panic!("fatal error in event loop: {err}");
            }
        }
    }

    async fn run_until_idle<F>(&mut self, pred: F)
    where
        F: Fn(&NetState) -> bool,
    {
        let mut no_sink = None;
        self.run_until(pred, &mut no_sink).await
    }

    fn add_conn(&mut self, stream: TcpStream, lid: i32) -> u64 {
        let id = self.next_conn_id;
        self.next_conn_id += 1;
        self.conns.insert(
            id,
            Conn {
                stream,
                lid,
                rbuf: BytesMut::with_capacity(RBUF_START),
            },
        );
        id
    }

    fn drop_conn(&mut self, id: u64) {
        if let Some(conn) = self.conns.remove(&id) {
            if conn.lid >= 0 {
                self.peers[conn.lid as usize].conn = None;
            }
        }
    }

    async fn read_conn(&mut self, id: u64, sink: &mut Option<Sink<'_>>) -> Result<()> {
        let Some(conn) = self.conns.get_mut(&id) else {
            return Ok(());
        };
        let mut closed = false;
        let mut chunk = [0u8; 4096];
        match conn.stream.try_read(&mut chunk) {
            Ok(0) => closed = true,
            Ok(n) => {
                if conn.rbuf.len() + n > RBUF_MAX {
                    tracing::warn!(conn = id, "dropping oversized command line");
                    conn.rbuf.clear();
                } else {
                    conn.rbuf.extend_from_slice(&chunk[..n]);
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => {
                // a failing descriptor must leave the loop, or the
                // readiness poll spins on it forever
                self.drop_conn(id);
                return Err(Error::Transport(e));
            }
        }

        let mut lines = Vec::new();
        while let Some(pos) = conn.rbuf.iter().position(|&b| b == b'\n') {
            let mut line = conn.rbuf.split_to(pos + 1);
            line.truncate(pos);
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        if closed && !conn.rbuf.is_empty() {
            // process the unterminated tail before forgetting the fd
            let tail = conn.rbuf.split();
            lines.push(String::from_utf8_lossy(&tail).into_owned());
        }

        for line in lines {
            if !self.conns.contains_key(&id) {
                break;
            }
            self.handle_line(id, &line, sink).await?;
        }

        if closed {
            let lid = self.conns.get(&id).map(|c| c.lid).unwrap_or(-1);
            tracing::debug!(conn = id, lid, "connection closed by peer");
            self.drop_conn(id);
        }
        Ok(())
    }

    // -- command dispatch --------------------------------------------

    async fn handle_line(
        &mut self,
        id: u64,
        line: &str,
        sink: &mut Option<Sink<'_>>,
    ) -> Result<()> {
        if line.trim().is_empty() {
            return Ok(());
        }
        let lid = self.conns.get(&id).map(|c| c.lid).unwrap_or(-1);
        let cmd = match Command::parse(line) {
            Ok(cmd) => cmd,
            Err(err) => {
                tracing::warn!(conn = id, lid, %err, "dropping malformed command");
                return Ok(());
            }
        };
        tracing::trace!(conn = id, lid, ?cmd, "got command");

        // commands accepted from peers without an assigned ID
        match cmd {
            Command::Register {
                location,
                host,
                port,
            } => return self.on_register(id, location, host, port).await,
            Command::MyId { lid: peerid } => return self.on_myid(id, peerid),
            Command::Help => return self.on_help(id).await,
            Command::Kill => {
                tracing::error!("terminating because of kill command");
                std::process::exit(1);
            }
            Command::Quit => {
                self.drop_conn(id);
                return Ok(());
            }
            Command::Comment(text) => {
                tracing::debug!(conn = id, lid, text, "peer comment");
                return Ok(());
            }
            Command::Status => return self.on_status(id).await,
            _ => {}
        }

        if lid < 0 {
            tracing::warn!(conn = id, "ignoring command from unknown sender: '{line}'");
            self.write_line(id, &Command::Comment("first register, see 'help'".to_string()))
                .await?;
            return Ok(());
        }

        // commands requiring an ID assigned by home
        match cmd {
            Command::Id {
                lid: peer_lid,
                location,
                host,
                port,
            } => self.on_id(peer_lid, location, host, port),
            Command::Phase { phase } => {
                if self.mylid == 0 {
                    tracing::warn!("ignoring phase command as home");
                    return Ok(());
                }
                tracing::debug!(phase, "got phase");
                self.phase = phase;
                Ok(())
            }
            Command::AllowSend { count, elemsize } => {
                let p = &mut self.peers[lid as usize];
                if p.scount != 0 {
                    tracing::warn!(lid, "allowsend while a grant is outstanding; dropping");
                    return Ok(());
                }
                tracing::debug!(lid, count, elemsize, "got send credit");
                p.scount = count;
                p.selemsize = elemsize;
                Ok(())
            }
            Command::Data { len, pos, bytes } => self.on_data(lid, len, pos, bytes, sink),
            Command::Resize {
                phase,
                maxid,
                leave,
            } => {
                if self.mylid != 0 {
                    tracing::warn!(lid, "ignoring resize request: not home");
                    return Ok(());
                }
                tracing::debug!(lid, phase, maxid, leave, "got resize request");
                self.resize_reqs.insert(lid, leave);
                Ok(())
            }
            Command::Remove { lid: removed } => self.on_remove(removed),
            Command::Done => {
                self.resize_done = true;
                Ok(())
            }
            other => {
                tracing::warn!(lid, "unhandled command {other:?}");
                Ok(())
            }
        }
    }

    async fn on_register(
        &mut self,
        id: u64,
        location: String,
        host: String,
        port: u16,
    ) -> Result<()> {
        if self.mylid != 0 {
            tracing::warn!("ignoring register command: not home");
            return Ok(());
        }
        if let Some(conn) = self.conns.get(&id) {
            if conn.lid >= 0 {
                tracing::warn!(lid = conn.lid, "cannot re-register an identified peer");
                return Ok(());
            }
        }
        if (self.maxid + 1) as usize >= MAX_PEERS {
            return Err(Error::Config {
                reason: format!("peer table full ({MAX_PEERS} entries)"),
            });
        }
        self.maxid += 1;
        let lid = self.maxid;
        if let Some(conn) = self.conns.get_mut(&id) {
            conn.lid = lid;
        }
        {
            let p = &mut self.peers[lid as usize];
            p.location = location.clone();
            p.host = host.clone();
            p.port = Some(port);
            p.conn = Some(id);
            p.recv = RecvState::default();
            p.scount = 0;
        }
        self.active_peers += 1;
        if self.in_resize {
            self.resize_added.push(lid);
        }
        tracing::debug!(lid, location, host, port, "registered new peer");

        // announce the newcomer to everyone (itself included), then
        // send it the table of already known peers
        let announce = Command::Id {
            lid,
            location,
            host,
            port,
        };
        for i in 1..=self.maxid {
            if self.peers[i as usize].removed {
                continue;
            }
            self.send_cmd(i, &announce).await?;
        }
        for i in 0..lid {
            if self.peers[i as usize].removed {
                continue;
            }
            let entry = {
                let p = &self.peers[i as usize];
                Command::Id {
                    lid: i,
                    location: p.location.clone(),
                    host: p.host.clone(),
                    port: p.port.unwrap_or(0),
                }
            };
            self.send_cmd(lid, &entry).await?;
        }
        Ok(())
    }

    fn on_myid(&mut self, id: u64, peerid: i32) -> Result<()> {
        let conn_lid = self.conns.get(&id).map(|c| c.lid).unwrap_or(-1);
        if conn_lid >= 0 {
            if conn_lid != peerid {
                return Err(Error::logic(format!(
                    "peer known as LID {conn_lid} claims to be {peerid}"
                )));
            }
            return Ok(());
        }
        if peerid == self.mylid {
            return Err(Error::logic(format!(
                "peer claims my own location-ID {peerid}"
            )));
        }
        if peerid < 0 || peerid as usize >= MAX_PEERS || peerid > self.maxid {
            tracing::warn!(peerid, "myid for unannounced location-ID; dropping");
            return Ok(());
        }
        if let Some(conn) = self.conns.get_mut(&id) {
            conn.lid = peerid;
        }
        self.peers[peerid as usize].conn = Some(id);
        tracing::debug!(lid = peerid, conn = id, "identified connection");
        Ok(())
    }

    fn on_id(&mut self, lid: i32, location: String, host: String, port: u16) -> Result<()> {
        if self.mylid == 0 {
            tracing::warn!("ignoring id command as home");
            return Ok(());
        }
        if lid < 0 || lid as usize >= MAX_PEERS {
            tracing::warn!(lid, "id outside peer table; dropping");
            return Ok(());
        }
        if self.mylid < 0 && location == self.location {
            self.mylid = lid;
        }
        // a peer counts as announced once its location is known; the
        // home entry starts with only an address and is completed by
        // its own id line
        let p = &mut self.peers[lid as usize];
        if !p.location.is_empty() {
            if p.location != location || p.port != Some(port) {
                return Err(Error::logic(format!(
                    "conflicting announcement for LID {lid}: '{location}' vs '{}'",
                    p.location
                )));
            }
            return Ok(());
        }
        p.location = location;
        p.host = host;
        p.port = Some(port);
        p.recv = RecvState::default();
        p.scount = 0;
        if lid != self.mylid {
            self.active_peers += 1;
        }
        if lid > self.maxid {
            self.maxid = lid;
        }
        tracing::debug!(
            lid,
            mine = lid == self.mylid,
            active_peers = self.active_peers,
            "seen location-ID"
        );
        Ok(())
    }

    fn on_data(
        &mut self,
        lid: i32,
        len: usize,
        pos: Option<(u64, String)>,
        bytes: Vec<u8>,
        sink: &mut Option<Sink<'_>>,
    ) -> Result<()> {
        let p = &mut self.peers[lid as usize];
        if p.recv.count == 0 || p.recv.off == p.recv.count {
            tracing::warn!(lid, "ignoring data without send permission");
            return Ok(());
        }
        if len != p.recv.elemsize {
            return Err(Error::logic(format!(
                "data element of {len} bytes, expected {}",
                p.recv.elemsize
            )));
        }
        let Some(sink) = sink.as_mut() else {
            return Err(Error::logic(
                "data arrived with credit but no pending receive".to_string(),
            ));
        };
        if let Some((seq, idx)) = &pos {
            if *seq != p.recv.off || *idx != p.recv.idx.display(sink.dims) {
                return Err(Error::logic(format!(
                    "element at ({seq}:{idx}), expected ({}:{})",
                    p.recv.off,
                    p.recv.idx.display(sink.dims)
                )));
            }
        }
        let idx = p.recv.idx;
        sink.map.deposit(sink.dtype, &idx, &bytes, p.recv.op)?;
        let slc = p
            .recv
            .slice
            .ok_or_else(|| Error::logic("receive state without slice".to_string()))?;
        p.recv.off += 1;
        let more = next_lex(&slc, &mut p.recv.idx);
        if more != (p.recv.off < p.recv.count) {
            return Err(Error::logic(format!(
                "receive traversal out of step at {}/{}",
                p.recv.off, p.recv.count
            )));
        }
        tracing::trace!(lid, off = p.recv.off, count = p.recv.count, "got data");
        Ok(())
    }

    fn on_remove(&mut self, lid: i32) -> Result<()> {
        if lid < 0 || lid as usize >= MAX_PEERS {
            tracing::warn!(lid, "remove outside peer table; dropping");
            return Ok(());
        }
        tracing::debug!(lid, "peer removed");
        let conn = self.peers[lid as usize].conn.take();
        self.peers[lid as usize].removed = true;
        if let Some(cid) = conn {
            self.conns.remove(&cid);
        }
        if lid != self.mylid && self.peers[lid as usize].is_known() {
            self.active_peers = self.active_peers.saturating_sub(1);
        }
        Ok(())
    }

    async fn on_help(&mut self, id: u64) -> Result<()> {
        let usage = [
            "Usage (first char of command is enough):",
            " allowsend <count> <elemsize>  : grant send credit",
            " data <len> [pos] <hex> ...    : one container element",
            " help                          : this help text",
            " id <id> <loc> <host> <port>   : announce location-ID info",
            " kill                          : ask process to terminate",
            " myid <id>                     : identify your location-ID",
            " phase <phase>                 : announce current phase",
            " quit                          : close connection",
            " register <loc> <host> <port>  : request assignment of an ID",
            " resize <phase> <maxid> [leave]: report phase boundary",
            " status                        : request status output",
        ];
        for line in usage {
            self.write_line(id, &Command::Comment(line.to_string())).await?;
        }
        Ok(())
    }

    async fn on_status(&mut self, id: u64) -> Result<()> {
        let mut lines = vec![format!("my location-ID is {}", self.mylid)];
        for lid in 0..=self.maxid {
            let p = &self.peers[lid as usize];
            if !p.is_known() {
                continue;
            }
            lines.push(format!(
                " LID {:2} loc '{}' at {}:{}{}",
                lid,
                p.location,
                p.host,
                p.port.unwrap_or(0),
                if p.removed { " (removed)" } else { "" },
            ));
        }
        for line in lines {
            self.write_line(id, &Command::Comment(line)).await?;
        }
        Ok(())
    }

    // -- connections and writes --------------------------------------

    async fn ensure_conn(&mut self, lid: i32) -> Result<u64> {
        if let Some(cid) = self.peers[lid as usize].conn {
            if self.conns.contains_key(&cid) {
                return Ok(cid);
            }
            self.peers[lid as usize].conn = None;
        }
        let (host, port) = {
            let p = &self.peers[lid as usize];
            let port = p.port.ok_or_else(|| Error::Config {
                reason: format!("no address known for LID {lid}"),
            })?;
            let host = if p.host.is_empty() {
                "localhost".to_string()
            } else {
                p.host.clone()
            };
            (host, port)
        };
        let stream = TcpStream::connect((host.as_str(), port)).await?;
        self.peers[lid as usize].addr = stream.peer_addr().ok();
        let id = self.add_conn(stream, lid);
        self.peers[lid as usize].conn = Some(id);
        tracing::debug!(lid, host, port, conn = id, "connected to peer");
        if self.mylid >= 0 {
            let myid = Command::MyId { lid: self.mylid };
            self.write_line(id, &myid).await?;
        }
        Ok(id)
    }

    async fn write_line(&mut self, conn_id: u64, cmd: &Command) -> Result<()> {
        let conn = self.conns.get_mut(&conn_id).ok_or_else(|| {
            Error::logic(format!("write on vanished connection {conn_id}"))
        })?;
        let mut line = cmd.render();
        line.push('\n');
        tracing::trace!(conn = conn_id, lid = conn.lid, line = line.trim_end(), "send");
        conn.stream.write_all(line.as_bytes()).await?;
        Ok(())
    }

    async fn send_cmd(&mut self, lid: i32, cmd: &Command) -> Result<()> {
        let cid = self.ensure_conn(lid).await?;
        self.write_line(cid, cmd).await
    }

    // -- slice transfer ----------------------------------------------

    /// Send the elements of `slc` from `map` to the peer, one `data`
    /// line per element. Blocks in the event loop until the peer has
    /// granted matching credit.
    async fn send_slice(
        &mut self,
        map: &Mapping,
        dims: usize,
        slc: &Slice,
        to_lid: i32,
    ) -> Result<()> {
        let count = slc.count();
        if count == 0 {
            return Ok(());
        }
        let elemsize = map.elemsize();
        let to = to_lid as usize;
        if self.peers[to].scount == 0 {
            tracing::debug!(to_lid, "waiting for send credit");
            self.run_until_idle(|st| st.peers[to].scount != 0).await;
        }
        let p = &self.peers[to];
        if p.scount != count || p.selemsize != elemsize {
            return Err(Error::logic(format!(
                "granted {} x {}B but sending {} x {}B",
                p.scount, p.selemsize, count, elemsize
            )));
        }
        for (seq, idx) in slc.iter().enumerate() {
            let range = map.byte_range(&idx)?;
            let cmd = Command::Data {
                len: elemsize,
                pos: Some((seq as u64, idx.display(dims))),
                bytes: map.base()[range].to_vec(),
            };
            self.send_cmd(to_lid, &cmd).await?;
        }
        // the grant is spent
        self.peers[to].scount = 0;
        Ok(())
    }

    /// Grant the peer credit for `slc` and run the event loop until
    /// every element has arrived in `map`, applying `op` against
    /// existing values when given.
    #[allow(clippy::too_many_arguments)]
    async fn recv_slice(
        &mut self,
        slc: &Slice,
        from_lid: i32,
        dtype: &DataType,
        dims: usize,
        map_no: usize,
        map: &mut Mapping,
        op: Option<ReduceOp>,
    ) -> Result<()> {
        let count = slc.count();
        if count == 0 {
            return Ok(());
        }
        let from = from_lid as usize;
        if self.peers[from].recv.count != 0 {
            return Err(Error::logic(format!(
                "receive from LID {from_lid} already pending"
            )));
        }
        self.peers[from].recv = RecvState {
            count,
            off: 0,
            elemsize: dtype.size(),
            map_no,
            slice: Some(*slc),
            idx: *slc.from(),
            op,
        };
        self.send_cmd(
            from_lid,
            &Command::AllowSend {
                count,
                elemsize: dtype.size(),
            },
        )
        .await?;
        let mut sink = Some(Sink { dtype, dims, map });
        self.run_until(
            |st| st.peers[from].recv.off == st.peers[from].recv.count,
            &mut sink,
        )
        .await;
        self.peers[from].clear_recv();
        Ok(())
    }

    // -- transition execution ----------------------------------------

    async fn exec_transition(&mut self, ctx: &mut ExecCtx<'_>) -> Result<()> {
        let group = Arc::clone(ctx.transition.group());
        let myid = group.myid();
        if myid < 0 {
            return Ok(());
        }
        let me = myid as usize;
        let t = ctx.transition;
        tracing::debug!(transition = %t, mylid = self.mylid, "exec transition");

        for red in &t.red {
            self.exec_reduce(ctx, red, &group).await?;
        }

        // double-sweep schedule, same pairwise order as the planner's
        // sorted lists, so credits and data pair deterministically
        for x in sweep_order(t, me) {
            match x {
                Transfer::In(r) => {
                    let lid = group.location(r.from);
                    let map = ctx.to.map_mut(r.map_no)?;
                    self.recv_slice(&r.slice, lid, ctx.dtype, ctx.dims, r.map_no, map, None)
                        .await?;
                }
                Transfer::Out(s) => {
                    let lid = group.location(s.to);
                    let map = ctx
                        .from
                        .ok_or_else(|| Error::logic("send without old mapping".to_string()))?
                        .map(s.map_no)?;
                    self.send_slice(map, ctx.dims, &s.slice, lid).await?;
                }
            }
        }
        Ok(())
    }

    /// Manual reduction: the lowest-ranked output member receives all
    /// contributions, reducing in place as elements arrive, then sends
    /// the result to the remaining output members.
    async fn exec_reduce(
        &mut self,
        ctx: &mut ExecCtx<'_>,
        red: &ReduceEntry,
        group: &Arc<Group>,
    ) -> Result<()> {
        let n = group.size();
        let me = group.myid() as usize;
        let reduce_rank = red
            .output
            .first(n)
            .ok_or_else(|| Error::logic("reduction with empty output group".to_string()))?;
        let reduce_lid = group.location(reduce_rank);

        if me != reduce_rank {
            if red.input.contains(me) {
                tracing::debug!(reduce_lid, slice = %red.slice, "reduce: send contribution");
                let from = ctx
                    .from
                    .ok_or_else(|| Error::logic("reduction input without old mapping".to_string()))?
                    .map(red.from_map)?;
                self.send_slice(from, ctx.dims, &red.slice, reduce_lid).await?;
            }
            if red.output.contains(me) {
                tracing::debug!(reduce_lid, slice = %red.slice, "reduce: receive result");
                let map = ctx.to.map_mut(red.to_map)?;
                self.recv_slice(&red.slice, reduce_lid, ctx.dtype, ctx.dims, red.to_map, map, None)
                    .await?;
            }
            return Ok(());
        }

        // this process runs the reduction
        let mut initialized = false;
        if red.input.contains(me) {
            let from = ctx
                .from
                .ok_or_else(|| Error::logic("reduction input without old mapping".to_string()))?
                .map(red.from_map)?;
            ctx.to
                .map_mut(red.to_map)?
                .copy_slice_from(from, &red.slice)?;
            initialized = true;
        }
        for in_rank in red.input.ranks(n) {
            if in_rank == me {
                continue;
            }
            let lid = group.location(in_rank);
            let op = initialized.then_some(red.op);
            tracing::debug!(
                lid,
                combine = initialized,
                slice = %red.slice,
                "reduce: receive contribution"
            );
            let map = ctx.to.map_mut(red.to_map)?;
            self.recv_slice(&red.slice, lid, ctx.dtype, ctx.dims, red.to_map, map, op)
                .await?;
            initialized = true;
        }
        for out_rank in red.output.ranks(n) {
            if out_rank == me {
                continue;
            }
            let lid = group.location(out_rank);
            tracing::debug!(lid, slice = %red.slice, "reduce: send result");
            let map = ctx.to.map(red.to_map)?;
            self.send_slice(map, ctx.dims, &red.slice, lid).await?;
        }
        Ok(())
    }

    // -- elastic resize ----------------------------------------------

    /// Negotiate a membership change at a phase boundary.
    ///
    /// Non-home reports `resize <phase> <maxid>` (with `leave` when
    /// departing) and waits for home's burst of `id`/`remove` lines
    /// terminated by `done`. Home gathers one report from every active
    /// peer, then broadcasts the changes. Runs only after transition
    /// traffic has drained, so `remove` never races in-flight data.
    async fn resize(&mut self, phase: i32, leave: bool) -> Result<Arc<Group>> {
        let old_world = self
            .world
            .clone()
            .ok_or_else(|| Error::logic("resize before bootstrap".to_string()))?;
        self.in_resize = true;
        self.resize_done = false;
        self.resize_added.clear();

        if self.mylid == 0 {
            if leave {
                return Err(Error::config(
                    "the home process cannot leave the world".to_string(),
                ));
            }
            // reports may already have arrived while the event loop
            // ran inside earlier backend calls; never discard them
            let expected = self.active_peers;
            tracing::debug!(phase, expected, "home: waiting for resize reports");
            self.run_until_idle(|s| s.resize_reqs.len() >= expected).await;

            let mut leavers: Vec<i32> = self
                .resize_reqs
                .iter()
                .filter(|(_, &leave)| leave)
                .map(|(&lid, _)| lid)
                .collect();
            leavers.sort_unstable();
            let targets: Vec<i32> = (1..=self.maxid)
                .filter(|&lid| self.peers[lid as usize].is_known() && !self.peers[lid as usize].removed)
                .collect();
            for &target in &targets {
                for &lid in &leavers {
                    self.send_cmd(target, &Command::Remove { lid }).await?;
                }
                self.send_cmd(target, &Command::Done).await?;
            }
            for &lid in &leavers {
                let conn = self.peers[lid as usize].conn.take();
                self.peers[lid as usize].removed = true;
                if let Some(cid) = conn {
                    self.conns.remove(&cid);
                }
                self.active_peers = self.active_peers.saturating_sub(1);
            }
            // a process registering at this boundary already had its
            // `id` lines broadcast; the phase is what completes its
            // bootstrap
            let added = std::mem::take(&mut self.resize_added);
            for &lid in &added {
                self.send_cmd(lid, &Command::Phase { phase }).await?;
            }
            self.resize_reqs.clear();
            self.phase = phase;
        } else {
            self.send_cmd(
                0,
                &Command::Resize {
                    phase,
                    maxid: self.maxid,
                    leave,
                },
            )
            .await?;
            self.run_until_idle(|s| s.resize_done).await;
            self.phase = phase;
        }
        self.in_resize = false;

        // the new world follows from the live peer table, which every
        // process agrees on at the boundary: unchanged keeps the old
        // group, pure departures derive a shrunk group, joins re-root
        // the world (ranks are the live location-IDs ascending)
        let locations = self.live_lids();
        let world = if locations[..] == old_world.locations()[..] {
            old_world
        } else if locations
            .iter()
            .all(|l| old_world.locations().contains(l))
        {
            let remove_ranks: Vec<usize> = old_world
                .locations()
                .iter()
                .enumerate()
                .filter(|&(_, loc)| !locations.contains(loc))
                .map(|(rank, _)| rank)
                .collect();
            Group::shrink(&old_world, &remove_ranks)?
        } else {
            let myid = locations
                .iter()
                .position(|&l| l == self.mylid)
                .map(|r| r as i32)
                .unwrap_or(-1);
            Group::world(locations, myid)
        };
        self.world = Some(Arc::clone(&world));
        tracing::info!(
            phase,
            size = world.size(),
            myid = world.myid(),
            "resize complete"
        );
        Ok(world)
    }
}

// -- socket setup ----------------------------------------------------

/// True iff `host` names an interface of this machine, probed by
/// binding an ephemeral socket to its address.
async fn check_local(host: &str) -> bool {
    let Ok(addrs) = tokio::net::lookup_host((host, 0u16)).await else {
        tracing::debug!(host, "home host does not resolve");
        return false;
    };
    for mut addr in addrs {
        addr.set_port(0);
        let sock = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        };
        let Ok(sock) = sock else {
            continue;
        };
        if sock.bind(addr).is_ok() {
            return true;
        }
    }
    false
}

/// Bind the listening socket. A process on the home host first tries
/// the home port (with address reuse); whoever wins that bind-and-
/// listen race is home. Everyone else listens on an OS-chosen port.
async fn bind_listener(
    try_home: bool,
    home_port: u16,
) -> Result<(TcpListener, u16, bool)> {
    if try_home {
        // bind can succeed while listen loses the race, so retry once
        // with a fresh socket before falling back
        for _ in 0..2 {
            let sock = TcpSocket::new_v4()?;
            sock.set_reuseaddr(true)?;
            if sock
                .bind(SocketAddr::from(([0, 0, 0, 0], home_port)))
                .is_err()
            {
                break;
            }
            match sock.listen(16) {
                Ok(listener) => return Ok((listener, home_port, true)),
                Err(err) => {
                    tracing::debug!(%err, "listen on home port failed, retrying");
                    continue;
                }
            }
        }
    }
    let sock = TcpSocket::new_v4()?;
    sock.bind(SocketAddr::from(([0, 0, 0, 0], 0)))?;
    let listener = sock.listen(16)?;
    let port = listener.local_addr()?.port();
    Ok((listener, port, false))
}



//! Binds one client connection to one image and one cache model.
//!
//! The transport collaborator parses HTTP, hands the query to a
//! `Session` and writes the returned reply head plus the streamed body
//! to its socket, applying chunked framing and optional gzip itself.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use log::{info, warn};

use crate::config::ServerConfig;
use crate::error::{Error, Result, UnitResult};
use crate::index::cache::ImageCache;
use crate::index::ImageIndex;
use crate::jpip::cache_model::CacheModel;
use crate::jpip::request::Request;
use crate::jpip::server::DataBinServer;
use crate::stats::SessionStats;


/// The media type of every response body this server produces.
pub const JPP_STREAM_CONTENT_TYPE: &str = "image/jpp-stream";


/// What the transport should answer, besides the streamed body.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {

    /// 200 on success; errors surface as 500 through `Error` instead.
    pub status: u16,

    /// Headers to send with the response.
    pub headers: Vec<(&'static str, String)>,

    /// Whether a jpp-stream body follows the headers.
    /// Without a body, the reply carries `Content-Length: 0`.
    pub has_body: bool,
}

impl Reply {
    fn new(status: u16) -> Self {
        Reply {
            status,
            headers: vec![
                ("Access-Control-Allow-Origin", "*".to_owned()),
                ("Cache-Control", "no-cache".to_owned()),
            ],
            has_body: false,
        }
    }

    fn with_header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    fn with_stream_body(mut self) -> Self {
        self.headers.push(("Content-Type", JPP_STREAM_CONTENT_TYPE.to_owned()));
        self.headers.push(("Transfer-Encoding", "chunked".to_owned()));
        self.has_body = true;
        self
    }
}


/// The channel state of one connection: at most one open image,
/// served by one data-bin server. Lives as long as the connection.
#[derive(Debug)]
pub struct Session {
    channel: String,
    max_chunk_size: usize,
    caching_folder: Option<PathBuf>,
    open: Option<OpenChannel>,
}

#[derive(Debug)]
struct OpenChannel {
    target: String,
    server: DataBinServer,
}

impl Session {

    /// A session for one connection. The channel id must be unique
    /// among the live connections of this server.
    pub fn new(channel: impl Into<String>, config: &ServerConfig) -> Self {
        Session {
            channel: channel.into(),
            max_chunk_size: config.max_chunk_size.max(256),
            caching_folder: config.caching_folder.clone(),
            open: None,
        }
    }

    /// The channel id of this session.
    pub fn channel(&self) -> &str { &self.channel }

    /// The image of the open channel, if any.
    pub fn image(&self) -> Option<&Arc<ImageIndex>> {
        self.open.as_ref().map(|open| open.server.image())
    }

    /// The target the open channel was created for, if any.
    pub fn target(&self) -> Option<&str> {
        self.open.as_ref().map(|open| open.target.as_str())
    }

    /// Handles one parsed request: opens, reuses or closes the channel,
    /// and streams the response body into the given transport sink.
    ///
    /// Any error closes the session; the transport should answer 500
    /// with the error text and drop the connection.
    pub fn handle(
        &mut self,
        images: &ImageCache,
        request: &Request,
        body: &mut dyn Write,
        stats: &dyn SessionStats,
    ) -> Result<Reply> {
        if request.mask.cclose() {
            self.handle_close(request, stats)
        }
        else if request.mask.cnew() {
            let reply = self.handle_new(images, request, stats)?;
            self.stream_body(images, body, stats)?;
            Ok(reply)
        }
        else if request.mask.cid() {
            let reply = self.handle_existing(request)?;
            self.stream_body(images, body, stats)?;
            Ok(reply)
        }
        else {
            Err(Error::bad_request("no channel parameter in the request"))
        }
    }

    /// `cclose`: drops the channel and its checkpoint.
    fn handle_close(&mut self, request: &Request, stats: &dyn SessionStats) -> Result<Reply> {
        if self.open.is_none() {
            return Err(Error::unknown_channel("close request without an open channel"));
        }

        // one channel per connection: the id must match, or close all
        match request.close_channel.as_deref() {
            Some("*") => {}
            Some(id) if id == self.channel => {}
            other => {
                return Err(Error::unknown_channel(
                    format!("close request for channel {:?}", other),
                ));
            }
        }

        self.open = None;
        self.discard_checkpoint();
        stats.channel_closed(&self.channel);
        info!("channel {} closed", self.channel);

        Ok(Reply::new(200).with_header("Content-Length", "0"))
    }

    /// `cnew`: opens the image and creates a fresh data-bin server,
    /// resuming a checkpointed cache model if one survives.
    fn handle_new(&mut self, images: &ImageCache, request: &Request, stats: &dyn SessionStats) -> Result<Reply> {
        if self.open.is_some() {
            return Err(Error::bad_request(
                "a channel is already open, one channel per connection",
            ));
        }

        let target = request.target.clone()
            .ok_or_else(|| Error::bad_request("cnew without a target"))?;

        let image = images.open(&target)?;
        let mut server = DataBinServer::new(image);

        if let Some(model) = self.load_checkpoint() {
            info!("channel {} resumes a checkpointed cache model", self.channel);
            server.restore_cache_model(model);
        }

        server.set_request(request)?;

        stats.channel_opened(&self.channel, &target);
        info!("channel {} opened for image {:?}", self.channel, target);

        self.open = Some(OpenChannel { target: target.clone(), server });
        self.store_checkpoint();

        Ok(Reply::new(200)
            .with_header("JPIP-cnew", format!("cid={},path=jpip,transport=http", self.channel))
            .with_header("JPIP-tid", target)
            .with_header("Access-Control-Expose-Headers", "JPIP-cnew,JPIP-tid")
            .with_stream_body())
    }

    /// `cid`: continues on the open channel.
    fn handle_existing(&mut self, request: &Request) -> Result<Reply> {
        let channel = &self.channel;

        let open = self.open.as_mut()
            .ok_or_else(|| Error::unknown_channel("request without an open channel"))?;

        match request.channel_id.as_deref() {
            Some(id) if id == channel.as_str() => {}
            other => {
                return Err(Error::unknown_channel(format!("request for channel {:?}", other)));
            }
        }

        open.server.set_request(request)?;
        Ok(Reply::new(200).with_stream_body())
    }

    /// Pulls chunks out of the data-bin server until the response is
    /// complete, handing each one to the transport.
    fn stream_body(&mut self, images: &ImageCache, body: &mut dyn Write, stats: &dyn SessionStats) -> UnitResult {
        let open = self.open.as_mut()
            .ok_or_else(|| Error::internal("streaming without an open channel"))?;

        let mut buffer = vec![0_u8; self.max_chunk_size];
        let mut total = 0_u64;

        loop {
            let (written, done) = open.server.generate_chunk(images.pool(), &mut buffer)?;

            if written > 0 {
                body.write_all(&buffer[.. written])?;
                stats.chunk_generated(written);
                total += written as u64;
            }

            if done { break; }
        }

        body.flush()?;
        stats.response_completed(total);

        if open.server.end_of_woi() {
            self.store_checkpoint();
        }

        Ok(())
    }

    fn checkpoint_path(&self) -> Option<PathBuf> {
        self.caching_folder.as_ref()
            .map(|folder| folder.join(format!("{}.model.json", self.channel)))
    }

    /// Persists the cache model, so a respawned worker can resume the
    /// channel. Failures only cost the resume, so they are not fatal.
    fn store_checkpoint(&self) {
        let (path, open) = match (self.checkpoint_path(), &self.open) {
            (Some(path), Some(open)) => (path, open),
            _ => return,
        };

        let written = serde_json::to_vec(open.server.cache_model()).ok()
            .and_then(|bytes| std::fs::write(&path, bytes).ok());

        if written.is_none() {
            warn!("could not checkpoint the cache model of channel {}", self.channel);
        }
    }

    fn load_checkpoint(&self) -> Option<CacheModel> {
        let bytes = std::fs::read(self.checkpoint_path()?).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    fn discard_checkpoint(&self) {
        if let Some(path) = self.checkpoint_path() {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.open.is_some() {
            self.discard_checkpoint();
        }
    }
}

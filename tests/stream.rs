
//! Full request-to-response scenarios over synthetic images.

mod common;

use common::CodestreamSpec;

use jpip::config::ServerConfig;
use jpip::error::Error;
use jpip::index::cache::ImageCache;
use jpip::jpip::cache_model::Amount;
use jpip::jpip::request::Request;
use jpip::jpip::server::DataBinServer;
use jpip::jpip::session::Session;
use jpip::stats::NullStats;


const META_DATA: u64 = 8;
const MAIN_HEADER: u64 = 6;
const TILE_HEADER: u64 = 2;
const PRECINCT: u64 = 0;

const EOR_WINDOW_DONE: u8 = 2;
const EOR_BYTE_LIMIT: u8 = 4;


fn config_for(folder: &std::path::Path) -> ServerConfig {
    ServerConfig {
        images_folder: folder.to_owned(),
        .. ServerConfig::default()
    }
}

fn full_window_query(verb: &str, target: &str) -> String {
    format!(
        "target={}&{}=http&fsiz=128,128&roff=0,0&rsiz=128,128&stream=0&len=65536",
        target, verb,
    )
}


/// A window covering the whole image streams the bootstrap bins, every
/// packet of every resolution, and a window-done end-of-response.
#[test]
fn full_window_over_a_raw_codestream() {
    let folder = common::test_images_folder("stream-full-window");
    let spec = CodestreamSpec::simple();
    std::fs::write(folder.join("image.j2c"), spec.build()).unwrap();
    let file_bytes = std::fs::read(folder.join("image.j2c")).unwrap();

    let config = config_for(&folder);
    let images = ImageCache::from_config(&config);

    let request = Request::from_query(&full_window_query("cnew", "image.j2c")).unwrap();

    let mut session = Session::new("7", &config);
    let mut body = Vec::new();
    let reply = session.handle(&images, &request, &mut body, &NullStats).unwrap();

    assert_eq!(reply.status, 200);
    assert!(reply.has_body);
    assert!(reply.headers.iter().any(|(name, value)|
        *name == "JPIP-cnew" && value.contains("cid=7")
    ));
    assert!(reply.headers.iter().any(|(name, value)|
        *name == "JPIP-tid" && value == "image.j2c"
    ));

    let items = common::decode_stream(&body);
    common::assert_ends_with_eor(&items, EOR_WINDOW_DONE);

    let messages = common::messages(&items);
    assert_eq!(messages.len(), 1 + 1 + 1 + 4);

    // one empty meta-data bin: the image has no meta-data at all
    assert_eq!(messages[0].class, META_DATA);
    assert_eq!(messages[0].bin_id, 0);
    assert!(messages[0].payload.is_empty());
    assert!(messages[0].last);

    // the complete main header
    assert_eq!(messages[1].class, MAIN_HEADER);
    assert_eq!(messages[1].codestream, 0);
    assert_eq!(messages[1].bin_offset, 0);
    assert!(messages[1].last);
    assert_eq!(messages[1].payload, &file_bytes[.. spec.header_length() as usize]);

    // the empty tile header that bootstraps a jpp-stream
    assert_eq!(messages[2].class, TILE_HEADER);
    assert!(messages[2].payload.is_empty());
    assert!(messages[2].last);

    // one precinct packet per resolution, in order
    for (resolution, message) in messages[3..].iter().enumerate() {
        assert_eq!(message.class, PRECINCT);
        assert_eq!(message.bin_id, resolution as u64);
        assert_eq!(message.bin_offset, 0);
        assert!(message.last);

        assert_eq!(message.payload.len() as u64, spec.packet_lengths[resolution]);
        assert!(message.payload.iter().all(|&byte|
            byte == CodestreamSpec::packet_fill(resolution)
        ));
    }

    // an identical follow-up request only gets the end-of-response
    let again = Request::from_query(
        "target=image.j2c&cid=7&fsiz=128,128&roff=0,0&rsiz=128,128&stream=0&len=65536",
    ).unwrap();

    let mut body = Vec::new();
    session.handle(&images, &again, &mut body, &NullStats).unwrap();

    let items = common::decode_stream(&body);
    assert!(common::messages(&items).is_empty());
    common::assert_ends_with_eor(&items, EOR_WINDOW_DONE);
}

/// A JP2 wraps the same codestream in boxes: the meta-data blocks come
/// first, separated by a place-holder box for the codestream.
#[test]
fn jp2_metadata_is_sent_with_place_holders() {
    let folder = common::test_images_folder("stream-jp2-meta");
    let spec = CodestreamSpec::simple();
    let codestream = spec.build();
    std::fs::write(folder.join("image.jp2"), common::build_jp2(&codestream)).unwrap();
    let file_bytes = std::fs::read(folder.join("image.jp2")).unwrap();

    let config = config_for(&folder);
    let images = ImageCache::from_config(&config);

    let request = Request::from_query(&full_window_query("cnew", "image.jp2")).unwrap();

    let mut session = Session::new("1", &config);
    let mut body = Vec::new();
    session.handle(&images, &request, &mut body, &NullStats).unwrap();

    let items = common::decode_stream(&body);
    common::assert_ends_with_eor(&items, EOR_WINDOW_DONE);

    let messages = common::messages(&items);
    let meta: Vec<_> = messages.iter().filter(|m| m.class == META_DATA).collect();

    // block before the codestream, the place-holder, the empty tail block
    assert_eq!(meta.len(), 3);

    assert_eq!(meta[0].bin_offset, 0);
    assert_eq!(meta[0].payload, &file_bytes[..32]);
    assert!(!meta[0].last);

    // the phld box: 44 fixed bytes plus the 8 byte original box header
    assert_eq!(meta[1].bin_offset, 32);
    assert_eq!(meta[1].payload.len(), 52);
    assert_eq!(&meta[1].payload[4..8], b"phld");
    assert_eq!(&meta[1].payload[20..28], &file_bytes[32..40]);
    assert!(!meta[1].last);

    assert_eq!(meta[2].bin_offset, 32 + 52);
    assert!(meta[2].payload.is_empty());
    assert!(meta[2].last);

    // the precincts still arrive
    let precincts = messages.iter().filter(|m| m.class == PRECINCT).count();
    assert_eq!(precincts, 4);
}

/// A byte budget cuts the response short; the cache model accounts for
/// exactly the bytes that made it into the stream, and a follow-up
/// request resumes where the budget struck.
#[test]
fn byte_limit_cuts_the_response() {
    let folder = common::test_images_folder("stream-byte-limit");
    let spec = CodestreamSpec::simple();
    std::fs::write(folder.join("image.j2c"), spec.build()).unwrap();

    let config = config_for(&folder);
    let images = ImageCache::from_config(&config);

    let image = images.open("image.j2c").unwrap();
    let mut server = DataBinServer::new(image);

    let request = Request::from_query(
        "fsiz=128,128&roff=0,0&rsiz=128,128&stream=0&len=100",
    ).unwrap();

    server.set_request(&request).unwrap();

    let mut buffer = vec![0_u8; 65536];
    let (written, done) = server.generate_chunk(images.pool(), &mut buffer).unwrap();

    assert!(done, "a tiny budget is exhausted in one chunk");
    assert!(written <= 100 + 3, "the budget bounds the chunk");

    let items = common::decode_stream(&buffer[.. written]);
    common::assert_ends_with_eor(&items, EOR_BYTE_LIMIT);

    // every sent byte, and nothing else, is accounted in the cache model
    let mut model = server.cache_model().clone();

    let mut sent_main_header = 0_u64;
    for message in common::messages(&items) {
        if message.class == MAIN_HEADER {
            sent_main_header += message.payload.len() as u64;
        }
    }

    assert!(sent_main_header > 0, "the clamped main header was partially sent");
    assert!(sent_main_header < spec.header_length(), "the budget clamped the header");

    assert_eq!(
        model.bin(jpip::jpip::DataBinClass::MainHeader, 0, 0),
        Amount::bytes(sent_main_header as u32),
    );

    // a follow-up with a real budget resumes exactly after the sent prefix
    let request = Request::from_query(
        "fsiz=128,128&roff=0,0&rsiz=128,128&stream=0&len=65536",
    ).unwrap();

    server.set_request(&request).unwrap();

    let (written, done) = server.generate_chunk(images.pool(), &mut buffer).unwrap();
    assert!(done);

    let items = common::decode_stream(&buffer[.. written]);
    common::assert_ends_with_eor(&items, EOR_WINDOW_DONE);

    let resumed = common::messages(&items);
    let main_header = resumed.iter().find(|m| m.class == MAIN_HEADER).unwrap();

    assert_eq!(main_header.bin_offset, sent_main_header);
    assert_eq!(
        main_header.payload.len() as u64,
        spec.header_length() - sent_main_header,
    );
    assert!(main_header.last);
}

/// Scenario: the client announces a cache model; announced bytes are
/// never sent again.
#[test]
fn announced_cache_model_suppresses_resends() {
    let folder = common::test_images_folder("stream-model");
    let spec = CodestreamSpec::simple();
    std::fs::write(folder.join("image.j2c"), spec.build()).unwrap();

    let config = config_for(&folder);
    let images = ImageCache::from_config(&config);

    let image = images.open("image.j2c").unwrap();
    let mut server = DataBinServer::new(image);

    // the client claims 100 bytes of the main header (more than it has)
    // and 50 bytes of precinct 0 (which holds a 60 byte packet)
    let request = Request::from_query(
        "fsiz=128,128&roff=0,0&rsiz=128,128&stream=0&len=65536&model=Hm:100,%5B0-0%5DP0:50",
    ).unwrap();

    server.set_request(&request).unwrap();

    let mut buffer = vec![0_u8; 65536];
    let (written, done) = server.generate_chunk(images.pool(), &mut buffer).unwrap();
    assert!(done);

    let items = common::decode_stream(&buffer[.. written]);
    common::assert_ends_with_eor(&items, EOR_WINDOW_DONE);
    let messages = common::messages(&items);

    // the whole main header is announced: never resent
    assert!(messages.iter().all(|m| m.class != MAIN_HEADER));

    // precinct 0 resumes after the announced 50 bytes
    let precinct_zero = messages.iter()
        .find(|m| m.class == PRECINCT && m.bin_id == 0)
        .unwrap();

    assert_eq!(precinct_zero.bin_offset, 50);
    assert_eq!(precinct_zero.payload.len(), 10);

    // the other precincts arrive in full
    let precinct_one = messages.iter()
        .find(|m| m.class == PRECINCT && m.bin_id == 1)
        .unwrap();

    assert_eq!(precinct_one.bin_offset, 0);
    assert_eq!(precinct_one.payload.len(), 20);
}

/// Scenario: a hyperlinked JPX behaves exactly like the image it
/// references, addressed as codestream zero.
#[test]
fn hyperlinked_jpx_streams_like_the_referenced_image() {
    let folder = common::test_images_folder("stream-jpx");
    std::fs::create_dir_all(folder.join("sub")).unwrap();

    let spec = CodestreamSpec::simple();
    std::fs::write(folder.join("sub/part.j2c"), spec.build()).unwrap();
    std::fs::write(
        folder.join("link.jpx"),
        common::build_hyperlinked_jpx("file://./sub/part.j2c"),
    ).unwrap();

    let config = config_for(&folder);
    let images = ImageCache::from_config(&config);

    let request = Request::from_query(&full_window_query("cnew", "link.jpx")).unwrap();

    let mut session = Session::new("9", &config);
    let mut body = Vec::new();
    session.handle(&images, &request, &mut body, &NullStats).unwrap();

    let items = common::decode_stream(&body);
    common::assert_ends_with_eor(&items, EOR_WINDOW_DONE);

    let messages = common::messages(&items);

    // all four packets of the referenced codestream, addressed as stream 0
    let precincts: Vec<_> = messages.iter().filter(|m| m.class == PRECINCT).collect();
    assert_eq!(precincts.len(), 4);
    assert!(precincts.iter().all(|m| m.codestream == 0));

    for (resolution, message) in precincts.iter().enumerate() {
        assert_eq!(message.payload.len() as u64, spec.packet_lengths[resolution]);
    }

    // the main header bytes come from the referenced file
    let referenced = std::fs::read(folder.join("sub/part.j2c")).unwrap();
    let main_header = messages.iter().find(|m| m.class == MAIN_HEADER).unwrap();
    assert_eq!(main_header.payload, &referenced[.. spec.header_length() as usize]);
}

/// Scenario: a valid PCRL image opens, but the first windowed request
/// fails, which the session surfaces as an error.
#[test]
fn pcrl_surfaces_as_a_session_error() {
    let folder = common::test_images_folder("stream-pcrl");
    let mut spec = CodestreamSpec::simple();
    spec.progression = 3; // PCRL

    std::fs::write(folder.join("image.j2c"), spec.build()).unwrap();

    let config = config_for(&folder);
    let images = ImageCache::from_config(&config);

    let request = Request::from_query(&full_window_query("cnew", "image.j2c")).unwrap();

    let mut session = Session::new("3", &config);
    let mut body = Vec::new();
    let result = session.handle(&images, &request, &mut body, &NullStats);

    assert!(matches!(result, Err(Error::NotSupported(_))));
}

/// Channel lifecycle: close requests and wrong channel ids.
#[test]
fn channel_lifecycle() {
    let folder = common::test_images_folder("stream-lifecycle");
    std::fs::write(folder.join("image.j2c"), CodestreamSpec::simple().build()).unwrap();

    let config = config_for(&folder);
    let images = ImageCache::from_config(&config);

    let mut session = Session::new("42", &config);
    let mut body = Vec::new();

    // a request without any channel parameter is invalid
    let request = Request::from_query("fsiz=16,16&len=100").unwrap();
    assert!(matches!(
        session.handle(&images, &request, &mut body, &NullStats),
        Err(Error::BadRequest(_)),
    ));

    // continuing a channel that was never opened is invalid
    let request = Request::from_query("cid=42&fsiz=16,16&len=100").unwrap();
    assert!(matches!(
        session.handle(&images, &request, &mut body, &NullStats),
        Err(Error::UnknownChannel(_)),
    ));

    // open
    let request = Request::from_query(&full_window_query("cnew", "image.j2c")).unwrap();
    session.handle(&images, &request, &mut body, &NullStats).unwrap();
    assert_eq!(session.target(), Some("image.j2c"));

    // a second open on the same connection is refused
    let request = Request::from_query(&full_window_query("cnew", "image.j2c")).unwrap();
    assert!(matches!(
        session.handle(&images, &request, &mut body, &NullStats),
        Err(Error::BadRequest(_)),
    ));

    // continuing with a foreign channel id is refused
    let request = Request::from_query("cid=41&len=100").unwrap();
    assert!(matches!(
        session.handle(&images, &request, &mut body, &NullStats),
        Err(Error::UnknownChannel(_)),
    ));

    // closing a foreign channel is refused, the session stays open
    let request = Request::from_query("cclose=41").unwrap();
    assert!(matches!(
        session.handle(&images, &request, &mut body, &NullStats),
        Err(Error::UnknownChannel(_)),
    ));
    assert!(session.image().is_some());

    // closing the right channel succeeds with an empty reply
    let request = Request::from_query("cclose=42").unwrap();
    let reply = session.handle(&images, &request, &mut body, &NullStats).unwrap();

    assert_eq!(reply.status, 200);
    assert!(!reply.has_body);
    assert!(reply.headers.iter().any(|(name, value)|
        *name == "Content-Length" && value == "0"
    ));
    assert!(session.image().is_none());

    // closing twice is invalid
    let request = Request::from_query("cclose=42").unwrap();
    assert!(matches!(
        session.handle(&images, &request, &mut body, &NullStats),
        Err(Error::UnknownChannel(_)),
    ));
}

/// A checkpointed cache model survives the connection: a respawned
/// worker resumes the channel without resending anything.
#[test]
fn checkpoints_resume_a_channel() {
    let folder = common::test_images_folder("stream-checkpoint");
    let caching = common::test_images_folder("stream-checkpoint-cache");
    std::fs::write(folder.join("image.j2c"), CodestreamSpec::simple().build()).unwrap();

    let config = ServerConfig {
        images_folder: folder,
        caching_folder: Some(caching),
        .. ServerConfig::default()
    };

    let images = ImageCache::from_config(&config);
    let request = Request::from_query(&full_window_query("cnew", "image.j2c")).unwrap();

    // first connection: stream the full window, then vanish without cclose
    {
        let mut session = Session::new("11", &config);
        let mut body = Vec::new();
        session.handle(&images, &request, &mut body, &NullStats).unwrap();
        assert!(common::messages(&common::decode_stream(&body)).len() > 1);

        // the channel stays open, so the checkpoint must survive the drop
        std::mem::forget(session);
    }

    // respawned worker, same channel id: everything is already cached
    let mut session = Session::new("11", &config);
    let mut body = Vec::new();
    session.handle(&images, &request, &mut body, &NullStats).unwrap();

    let items = common::decode_stream(&body);
    assert!(common::messages(&items).is_empty(), "nothing is resent");
    common::assert_ends_with_eor(&items, EOR_WINDOW_DONE);
}

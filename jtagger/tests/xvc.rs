//! End-to-end tests over real TCP: the XVC server in one thread serving a
//! simulated chain, and either a raw socket or the XVC client cable on the
//! other end.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::JoinHandle;

use jtagger::cable::loopback::Loopback;
use jtagger::cable::sim::{SimChain, SimDevice};
use jtagger::cable::xvc::XvcCable;
use jtagger::server::{self, ServerOptions};
use jtagger::{Cable, JtagTemplate, TapState, Tdi};

/// Spawns a server for exactly one client on an ephemeral port.
fn spawn_server(cable: Cable) -> (std::net::SocketAddr, JoinHandle<Cable>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = std::thread::spawn(move || {
        let mut cable = cable;
        server::serve_one(listener, &mut cable, &ServerOptions::default()).unwrap();
        cable
    });
    (addr, handle)
}

fn artix_chain() -> Cable {
    let device = SimDevice::new(6, 0x1363_1093, 0b110101).with_register(0b100011, 32, 0);
    Cable::Loopback(Loopback::tap(SimChain::new(vec![device])))
}

#[test]
fn wire_framing_byte_for_byte() {
    let (addr, handle) = spawn_server(Cable::Loopback(Loopback::mirror()));
    let mut socket = TcpStream::connect(addr).unwrap();

    // getinfo: names the protocol version and the vector limit.
    socket.write_all(b"getinfo:").unwrap();
    let mut reply = vec![0u8; "xvcServer_v1.0:120000\n".len()];
    socket.read_exact(&mut reply).unwrap();
    assert_eq!(reply, b"xvcServer_v1.0:120000\n");

    // settck: echoes the four period bytes.
    socket.write_all(b"settck:").unwrap();
    socket.write_all(&100u32.to_le_bytes()).unwrap();
    let mut echo = [0u8; 4];
    socket.read_exact(&mut echo).unwrap();
    assert_eq!(echo, 100u32.to_le_bytes());

    // shift: 8 bits, TMS=0xFF, TDI=0x55; exactly one TDO byte comes back,
    // and on a mirror it is the TDI byte.
    socket.write_all(b"shift:").unwrap();
    socket.write_all(&8u32.to_le_bytes()).unwrap();
    socket.write_all(&[0xFF, 0x55]).unwrap();
    let mut tdo = [0u8; 1];
    socket.read_exact(&mut tdo).unwrap();
    assert_eq!(tdo, [0x55]);

    drop(socket);
    handle.join().unwrap();
}

#[test]
fn idcode_read_through_client_and_server() {
    let (addr, handle) = spawn_server(artix_chain());
    let client = XvcCable::connect(&addr.ip().to_string(), addr.port()).unwrap();
    let mut cable = Cable::Xvc(client);

    let mut idcode = JtagTemplate::new();
    idcode.read_dr(32, Tdi::AllOnes, true).unwrap();

    // The template is reusable; the server caches the command shape too.
    for _ in 0..3 {
        let words = idcode.run_words(&mut cable, &[]).unwrap();
        assert_eq!(words, vec![0x1363_1093]);
        // Xilinx manufacturer 0x049 in bits 11:1, LSB always high.
        assert_eq!(words[0] & 0xFFF, 0x093);
    }

    cable.close();
    handle.join().unwrap();
}

#[test]
fn user4_write_read_round_trip() {
    let (addr, handle) = spawn_server(artix_chain());
    let client = XvcCable::connect(&addr.ip().to_string(), addr.port()).unwrap();
    let mut cable = Cable::Xvc(client);

    // Load USER4 and push a word through it.
    let mut load = JtagTemplate::new();
    load.write_ir(6, Tdi::bits("100011"), true).unwrap();
    load.write_dr(32, Tdi::Variable, true).unwrap();
    assert!(load.run(&mut cable, &[0xDEAD_BEEF]).unwrap().is_empty());

    // Read it back without resetting; reset would reselect IDCODE.
    let mut readback = JtagTemplate::starting_at(TapState::SelectDr);
    readback.read_dr(32, 0u64, true).unwrap();
    let words = readback.run_words(&mut cable, &[]).unwrap();
    assert_eq!(words, vec![0xDEAD_BEEF]);

    cable.close();
    handle.join().unwrap();
}

#[test]
fn variable_data_round_trips_across_lanes() {
    // A 100-bit shift exercises the 64-bit lane splitting on both sides.
    let (addr, handle) = spawn_server(Cable::Loopback(Loopback::mirror()));
    let client = XvcCable::connect(&addr.ip().to_string(), addr.port()).unwrap();
    let mut cable = Cable::Xvc(client);

    let mut t = JtagTemplate::starting_at(TapState::ShiftDr);
    t.shift(64, Tdi::Variable, false, true).unwrap();
    t.shift(36, Tdi::Variable, false, true).unwrap();
    let words =
        t.run_words(&mut cable, &[0x0123_4567_89AB_CDEF, 0x5_5AA5_5AA5]).unwrap();
    assert_eq!(words, vec![0x0123_4567_89AB_CDEF, 0x5_5AA5_5AA5]);

    cable.close();
    handle.join().unwrap();
}

//! Minimal courier server: answers every GET with a text body and echoes
//! PUT bodies back.
//!
//! ```text
//! cargo run --example serve -- <port> <cert.pem> <key.pem> <token>
//! ```

use courier::{Direction, Event, Server, ServerConfig};

fn main() -> Result<(), courier::Error> {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 5 {
        eprintln!("usage: serve <port> <cert.pem> <key.pem> <token>");
        std::process::exit(1);
    }

    let server = Server::new(ServerConfig {
        auth_token: args[4].clone(),
        port: args[1].parse().expect("invalid port"),
        cert_path: args[2].clone(),
        key_path: args[3].clone(),
    })?;
    eprintln!("listening on {}", server.local_addr());

    while server.poll(
        |event| match event {
            Event::Connect { connection_id, peer } => {
                eprintln!("[{connection_id}] connected from {peer}");
            }
            Event::Timeout { connection_id } => {
                eprintln!("[{connection_id}] gone");
            }
            Event::Data {
                connection_id,
                stream,
                direction: Direction::Request,
            } => {
                eprintln!(
                    "[{connection_id}] {} {} ({} bytes)",
                    stream.method,
                    stream.path,
                    stream.body.len()
                );
                let result = if stream.method == "PUT" {
                    server.respond(
                        connection_id,
                        stream.id,
                        200,
                        &stream.content_type,
                        &stream.header_info,
                        &stream.body,
                    )
                } else {
                    server.respond(connection_id, stream.id, 200, "text/plain", "", b"hello")
                };
                if let Err(e) = result {
                    eprintln!("[{connection_id}] respond failed: {e}");
                }
            }
            Event::Data { .. } => {}
        },
        -1,
    ) {}

    Ok(())
}

//! Minimal courier client: fetch one path and print the response.
//!
//! ```text
//! cargo run --example get -- <host> <port> <cert.pem> <token> <path>
//! ```

use courier::{Client, ClientConfig, Direction, Event};

fn main() -> Result<(), courier::Error> {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 6 {
        eprintln!("usage: get <host> <port> <cert.pem> <token> <path>");
        std::process::exit(1);
    }

    let client = Client::new(ClientConfig {
        auth_token: args[4].clone(),
        host: args[1].clone(),
        port: args[2].parse().expect("invalid port"),
        cert_path: args[3].clone(),
    })?;
    let path = args[5].clone();

    let mut done = false;
    while !done
        && client.poll(
            |event| match event {
                Event::Connect { peer, .. } => {
                    eprintln!("connected to {peer}");
                    let id = client.request(&path, "", "", b"");
                    if id < 0 {
                        eprintln!("request failed");
                        done = true;
                    }
                }
                Event::Timeout { .. } => {
                    eprintln!("connection lost");
                    done = true;
                }
                Event::Data {
                    stream,
                    direction: Direction::Response,
                    ..
                } => {
                    eprintln!(
                        "{} {} ({} bytes)",
                        stream.status,
                        stream.content_type,
                        stream.body.len()
                    );
                    println!("{}", String::from_utf8_lossy(&stream.body));
                    done = true;
                }
                Event::Data { .. } => {}
            },
            1000,
        )
    {}

    Ok(())
}

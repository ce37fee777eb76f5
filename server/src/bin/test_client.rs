//! Manual line-protocol client for poking at a running server.
//!
//! Inbound frames are printed as they arrive; stdin lines are translated
//! to client frames: `/name`, `/add`, `/remove`, `/approve`, `/reject`,
//! `/success`, `/fail`, `/pm <player> <text>`; anything else is chat.

use shared::{encode_frame, ClientOpcode, FrameDecoder, ServerOpcode};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:5555".to_string());
    let stream = TcpStream::connect(&addr).await?;
    println!("Connected to {}", addr);
    let (mut read_half, mut write_half) = stream.into_split();

    tokio::spawn(async move {
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 1024];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    decoder.extend(&buf[..n]);
                    while let Some(frame) = decoder.next_frame() {
                        match frame {
                            Ok((opcode, payload)) => match ServerOpcode::try_from(opcode) {
                                Ok(op) => println!("[{:?}] {}", op, payload),
                                Err(_) => println!("[opcode {}] {}", opcode, payload),
                            },
                            Err(e) => println!("[bad frame] {}", e),
                        }
                    }
                }
            }
        }
        println!("Server closed the connection");
        std::process::exit(0);
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let (opcode, payload) = parse_line(&line);
        let frame = if payload.is_empty() {
            encode_frame(opcode, &[])?
        } else {
            encode_frame(opcode, &[&payload])?
        };
        write_half.write_all(&frame).await?;
    }

    Ok(())
}

fn parse_line(line: &str) -> (ClientOpcode, String) {
    let (command, rest) = match line.split_once(' ') {
        Some((command, rest)) => (command, rest),
        None => (line, ""),
    };
    match command {
        "/name" => (ClientOpcode::Name, rest.to_string()),
        "/pm" => (ClientOpcode::SendPm, rest.to_string()),
        "/add" => (ClientOpcode::TeamAdd, rest.to_string()),
        "/remove" => (ClientOpcode::TeamRemove, rest.to_string()),
        "/approve" => (ClientOpcode::Approve, String::new()),
        "/reject" => (ClientOpcode::Reject, String::new()),
        "/success" => (ClientOpcode::Success, String::new()),
        "/fail" => (ClientOpcode::Fail, String::new()),
        _ => (ClientOpcode::Message, line.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line_commands() {
        assert_eq!(
            parse_line("/name alice"),
            (ClientOpcode::Name, "alice".to_string())
        );
        assert_eq!(parse_line("/approve"), (ClientOpcode::Approve, String::new()));
        assert_eq!(
            parse_line("/pm bob trust me"),
            (ClientOpcode::SendPm, "bob trust me".to_string())
        );
        assert_eq!(
            parse_line("hello everyone"),
            (ClientOpcode::Message, "hello everyone".to_string())
        );
    }
}

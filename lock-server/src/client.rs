use anyhow::{Context, Result, bail};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    message::{Operation, Reply, Request, Status, read_message, write_message},
};

const USAGE: &str = "usage: lock K | unlock K | get K | set K N | incr K N | /quit";

pub async fn run(args: ClientArgs) -> Result<()> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;
    info!("connected to {}", args.server);

    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    run_client_loop(&mut reader, &mut writer, &mut stdin, &mut input).await?;

    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
    Ok(())
}

async fn run_client_loop(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            server_message = read_message::<_, Reply>(reader) => {
                match server_message? {
                    Some(reply) => write_stdout(&render_reply(&reply)).await?,
                    None => {
                        write_stdout("*** server closed the connection").await?;
                        break;
                    }
                }
            }
            bytes_read = stdin.read_line(input) => {
                if bytes_read? == 0 {
                    break;
                }
                match parse_input(input) {
                    Ok(Input::Send(request)) => write_message(writer, &request).await?,
                    Ok(Input::Quit) => {
                        write_stdout("*** bye").await?;
                        break;
                    }
                    Ok(Input::Empty) => {}
                    Err(err) => write_stderr(&format!("!!! {err}; {USAGE}")).await?,
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
pub enum Input {
    Send(Request),
    Quit,
    Empty,
}

/// Turns a typed line such as `incr hits 3` into a request.
pub fn parse_input(line: &str) -> Result<Input> {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return Ok(Input::Empty);
    };
    if command.eq_ignore_ascii_case("/quit") {
        return Ok(Input::Quit);
    }

    let Some(op) = Operation::parse(&command.to_ascii_lowercase()) else {
        bail!("unknown command '{command}'");
    };
    let Some(target) = words.next() else {
        bail!("'{}' needs a key", op.name());
    };

    let request = Request::new(op, target);
    let request = match op {
        Operation::Set | Operation::Incr => match words.next() {
            Some(arg) => request.with_arg(arg),
            None => bail!("'{}' needs a number", op.name()),
        },
        Operation::Lock | Operation::Unlock | Operation::Get => request,
    };

    if words.next().is_some() {
        bail!("too many arguments");
    }
    Ok(Input::Send(request))
}

pub fn render_reply(reply: &Reply) -> String {
    match (reply.status, &reply.error, &reply.value) {
        (Status::Ok, _, Some(value)) => format!("OK {value}"),
        (Status::Ok, _, None) => "OK".to_string(),
        (Status::Ko, Some(error), _) => format!("KO {error}"),
        (Status::Ko, None, _) => "KO".to_string(),
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}

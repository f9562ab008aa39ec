use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, anyhow};
use crossbeam_channel::select;

use matforge_render_engine::{
    engine::RenderEngine,
    protocol::{EngineCommand, EngineResponse, InitializePayload, RenderNodePayload, WireGraph},
    renderer,
    renderer::gpu::GpuContext,
    ws,
};

#[derive(Debug, Clone)]
struct Cli {
    addr: String,
    frame_ms: u64,
    graph_json: Option<PathBuf>,
    render_node: Option<u32>,
    output: Option<PathBuf>,
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8090".to_string(),
            frame_ms: 33,
            graph_json: None,
            render_node: None,
            output: None,
        }
    }
}

fn parse_cli(args: &[String]) -> Result<Cli> {
    let mut cli = Cli::default();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" => {
                let Some(v) = args.get(i + 1) else {
                    return Err(anyhow!("missing value for --addr"));
                };
                cli.addr = v.clone();
                i += 2;
            }
            "--frame-ms" => {
                let Some(v) = args.get(i + 1) else {
                    return Err(anyhow!("missing value for --frame-ms"));
                };
                cli.frame_ms = v
                    .parse()
                    .map_err(|e| anyhow!("invalid --frame-ms value: {e}"))?;
                i += 2;
            }
            "--graph-json" => {
                let Some(v) = args.get(i + 1) else {
                    return Err(anyhow!("missing value for --graph-json"));
                };
                cli.graph_json = Some(PathBuf::from(v));
                i += 2;
            }
            "--render-node" => {
                let Some(v) = args.get(i + 1) else {
                    return Err(anyhow!("missing value for --render-node"));
                };
                cli.render_node = Some(
                    v.parse()
                        .map_err(|e| anyhow!("invalid --render-node value: {e}"))?,
                );
                i += 2;
            }
            "--output" => {
                let Some(v) = args.get(i + 1) else {
                    return Err(anyhow!("missing value for --output"));
                };
                cli.output = Some(PathBuf::from(v));
                i += 2;
            }
            other => {
                return Err(anyhow!(
                    "unknown argument: {other} (supported: --addr <host:port>, --frame-ms <n>, \
                     --graph-json <graph.json>, --render-node <id>, --output <file.png>)"
                ));
            }
        }
    }
    Ok(cli)
}

/// Script-friendly mode: load a graph from disk, render one node, save a PNG.
fn run_headless_render_once(
    graph_path: &std::path::Path,
    node_id: u32,
    output: PathBuf,
) -> Result<()> {
    let text = std::fs::read_to_string(graph_path)
        .map_err(|e| anyhow!("failed to read --graph-json file {}: {e}", graph_path.display()))?;
    let material: WireGraph = serde_json::from_str(&text)
        .map_err(|e| anyhow!("invalid graph json in {}: {e}", graph_path.display()))?;

    let gpu = GpuContext::headless()?;
    let mut engine = RenderEngine::new(Some(gpu));
    engine.handle_command(EngineCommand::Initialize(InitializePayload {
        material,
        start: false,
    }))?;

    let response = engine.handle_command(EngineCommand::RenderNode(RenderNodePayload {
        node_id,
        output_width: None,
        output_height: None,
        output_filter: None,
    }))?;

    match response {
        Some(EngineResponse::PixelBuffer(buffer)) => {
            let pixels = buffer.decode_pixels()?;
            let png = renderer::encode_png(buffer.width, buffer.height, &pixels)?;
            std::fs::write(&output, png)
                .map_err(|e| anyhow!("failed to write {}: {e}", output.display()))?;
            println!("[headless] saved: {}", output.display());
            Ok(())
        }
        Some(EngineResponse::Error(e)) => Err(anyhow!("{}: {}", e.code, e.message)),
        other => Err(anyhow!("unexpected render response: {other:?}")),
    }
}

fn run_server(cli: &Cli) -> Result<()> {
    let gpu = match GpuContext::headless() {
        Ok(gpu) => Some(gpu),
        Err(e) => {
            // The server still answers protocol traffic; initialize replies
            // GPU_UNAVAILABLE so the authoring side can surface it once.
            log::error!("[startup] GPU unavailable: {e:#}");
            None
        }
    };
    let mut engine = RenderEngine::new(gpu);

    let (command_tx, command_rx) = crossbeam_channel::unbounded::<ws::InboundCommand>();
    let hub = ws::WsHub::default();
    ws::spawn_ws_server(&cli.addr, command_tx, hub.clone())?;

    let ticks = crossbeam_channel::tick(Duration::from_millis(cli.frame_ms.max(1)));
    loop {
        select! {
            recv(command_rx) -> inbound => {
                let Ok(inbound) = inbound else {
                    break;
                };
                let request_id = inbound.request_id.clone();
                match engine.handle_command(inbound.command) {
                    Ok(Some(response)) => {
                        hub.broadcast_message(&response.into_message(request_id));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        log::error!("[engine] command failed: {e:#}");
                        let response = EngineResponse::error("ENGINE_ERROR", format!("{e:#}"));
                        hub.broadcast_message(&response.into_message(request_id));
                    }
                }
            }
            recv(ticks) -> _ => {
                engine.tick();
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    let argv: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_cli(&argv)?;

    if let (Some(graph_path), Some(node_id)) = (cli.graph_json.as_deref(), cli.render_node) {
        let output = cli
            .output
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("node-{node_id}.png")));
        return run_headless_render_once(graph_path, node_id, output);
    }
    if cli.graph_json.is_some() || cli.render_node.is_some() {
        return Err(anyhow!(
            "--graph-json and --render-node must be used together"
        ));
    }

    run_server(&cli)
}

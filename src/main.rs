use anyhow::{Context, Result, bail};
use clap::{ArgAction, Args, Parser, Subcommand};
use snaplens::analysis::{
    AnalysisEvent, AnalysisSummary, ImageConsumer, MetadataAnalyzer, VisionAnalyzer,
    spawn_analysis_worker,
};
use snaplens::answer_log::AnswerLog;
use snaplens::authorization::{
    AuthorizationBroker, MacOsPermissionPrompt, PermissionPrompt, StaticPermissionPrompt,
};
use snaplens::coordinator::{CoordinatorEvent, EventSink, SessionCoordinator};
use snaplens::encode::CropRegion;
use snaplens::error::CaptureError;
use snaplens::mirror::{DisplayMetrics, MirrorPlatform, ScreencaptureMirror, SyntheticMirror};
use snaplens::paths::{default_answer_log_path, default_settings_path};
use snaplens::permission_watch::spawn_permission_watch;
use snaplens::permissions::{
    ScreenRecordingStatus, open_screen_recording_settings, screen_recording_help_message,
    screen_recording_status,
};
use snaplens::review::{
    ReviewCommand, ReviewDesk, ReviewEvent, ReviewMode, spawn_review_stage,
};
use snaplens::service::{CaptureService, DesktopForegroundHost, ServiceHandle};
use snaplens::session::{ScreenMirror, SessionGate};
use snaplens::settings::{Settings, ensure_sample_settings};
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Parser)]
#[command(name = "snaplens")]
#[command(about = "Capture the screen and ask a vision model about it")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Capture once and print the answer.
    Capture(CaptureArgs),
    /// Keep the capture service running and read commands from stdin.
    Run(RunArgs),
    /// Write a commented settings.toml if none exists.
    InitSettings {
        #[arg(long)]
        settings: Option<PathBuf>,
    },
    /// Show the screen recording permission state.
    Permissions {
        #[arg(long, action = ArgAction::SetTrue)]
        open_settings: bool,
    },
}

#[derive(Debug, Args, Clone)]
struct CommonArgs {
    #[arg(long)]
    settings: Option<PathBuf>,

    #[arg(long)]
    answers: Option<PathBuf>,

    /// Describe the image locally instead of calling the model.
    #[arg(long, action = ArgAction::SetTrue)]
    no_analyze: bool,

    /// Use a synthetic display and auto-granted permission.
    #[arg(long, action = ArgAction::SetTrue)]
    simulate: bool,

    /// Keep only this part of the display: x,y,width,height in pixels.
    #[arg(long)]
    crop: Option<CropRegion>,
}

#[derive(Debug, Args, Clone)]
struct RunArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Hold each capture until it is sent, cropped or discarded.
    #[arg(long, action = ArgAction::SetTrue)]
    confirm: bool,
}

#[derive(Debug, Args, Clone)]
struct CaptureArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Wait this long before capturing, e.g. to switch to another app.
    #[arg(long, value_parser = parse_duration)]
    defer: Option<Duration>,
}

fn parse_duration(value: &str) -> std::result::Result<Duration, String> {
    humantime::parse_duration(value).map_err(|e| e.to_string())
}

const SIMULATED_DISPLAY: DisplayMetrics = DisplayMetrics {
    width: 1170,
    height: 2532,
    density_dpi: 460,
};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Capture(args) => capture_once(args).await,
        Commands::Run(args) => run_interactive(args).await,
        Commands::InitSettings { settings } => {
            let path = settings.unwrap_or_else(default_settings_path);
            if ensure_sample_settings(&path)? {
                println!("wrote {}", path.display());
            } else {
                println!("{} already exists", path.display());
            }
            Ok(())
        }
        Commands::Permissions { open_settings } => {
            print_permission_status(open_settings);
            Ok(())
        }
    }
}

struct Pipeline {
    service: ServiceHandle,
    events: mpsc::UnboundedReceiver<CoordinatorEvent>,
    review: mpsc::UnboundedSender<ReviewCommand>,
    reviews: mpsc::UnboundedReceiver<ReviewEvent>,
    analysis: JoinHandle<AnalysisSummary>,
    answers: mpsc::UnboundedReceiver<AnalysisEvent>,
    redirect_delay: Duration,
}

fn start_pipeline(common: &CommonArgs, review_mode: Option<ReviewMode>) -> Result<Pipeline> {
    let settings_path = common.settings.clone().unwrap_or_else(default_settings_path);
    let mut settings = Settings::load(&settings_path)?.with_env_overrides();
    if common.crop.is_some() {
        settings.capture.crop = common.crop;
    }
    let review_mode = review_mode.unwrap_or(settings.analysis.review);

    let prompt: Arc<dyn PermissionPrompt> = if common.simulate {
        Arc::new(StaticPermissionPrompt::granting())
    } else {
        Arc::new(MacOsPermissionPrompt)
    };
    let platform: Arc<dyn MirrorPlatform> = if common.simulate {
        Arc::new(SyntheticMirror::new(SIMULATED_DISPLAY).with_row_padding(10))
    } else {
        Arc::new(ScreencaptureMirror)
    };

    let consumer = build_consumer(&settings, common.no_analyze)?;
    let answer_log = AnswerLog::new(common.answers.clone().unwrap_or_else(default_answer_log_path));

    let (submit_tx, submit_rx) = mpsc::unbounded_channel();
    let (answer_tx, answers) = mpsc::unbounded_channel();
    let analysis = spawn_analysis_worker(submit_rx, consumer, Some(answer_log), Some(answer_tx));

    let (image_tx, image_rx) = mpsc::unbounded_channel();
    let (review, review_rx) = mpsc::unbounded_channel();
    let (review_event_tx, reviews) = mpsc::unbounded_channel();
    spawn_review_stage(
        image_rx,
        review_rx,
        ReviewDesk::new(review_mode, settings.capture.jpeg_quality),
        submit_tx,
        Some(review_event_tx),
    );

    let (event_tx, events) = mpsc::unbounded_channel();
    let coordinator = SessionCoordinator::new(
        Arc::new(AuthorizationBroker::new(prompt)),
        ScreenMirror::new(platform, SessionGate::new()),
        image_tx,
        settings.coordinator_config(),
        EventSink::new(event_tx),
    );

    let service = CaptureService::start(Arc::new(DesktopForegroundHost), coordinator, None)
        .map_err(|err| anyhow::anyhow!("{}: {err}", err.user_message()))?;

    if !common.simulate {
        let _ = spawn_permission_watch(service.commands(), |status| {
            eprintln!("screen recording permission changed: {status:?}");
        });
    }

    Ok(Pipeline {
        service,
        events,
        review,
        reviews,
        analysis,
        answers,
        redirect_delay: settings.capture.redirect_delay(),
    })
}

fn build_consumer(settings: &Settings, no_analyze: bool) -> Result<Arc<dyn ImageConsumer>> {
    if no_analyze {
        return Ok(Arc::new(MetadataAnalyzer));
    }

    let Some(api_key) = settings.analysis.api_key() else {
        eprintln!("No API key configured. Falling back to local metadata analyzer.");
        return Ok(Arc::new(MetadataAnalyzer));
    };
    let plan = settings.analysis.plan()?;
    Ok(Arc::new(VisionAnalyzer::with_plan(
        api_key,
        settings.analysis.normalized_base_url(),
        plan,
        settings.analysis.prompt.clone(),
    )))
}

async fn capture_once(args: CaptureArgs) -> Result<()> {
    let Pipeline {
        service,
        mut events,
        analysis,
        mut answers,
        ..
    } = start_pipeline(&args.common, Some(ReviewMode::Auto))?;

    service.capture(args.defer)?;

    let mut failure = None;
    while let Some(event) = events.recv().await {
        print_event(&event);
        match event {
            CoordinatorEvent::Delivered { .. } => break,
            CoordinatorEvent::Failed { error, .. } => {
                failure = Some(error);
                break;
            }
            _ => {}
        }
    }

    service.stop().await?;
    analysis.await.context("analysis worker failed")?;
    while let Some(answer) = answers.recv().await {
        print_answer(&answer);
    }

    if let Some(error) = failure {
        if error.suggests_retry() {
            bail!("{} Run the command again.", error.user_message());
        }
        bail!("{}", error.user_message());
    }
    Ok(())
}

const CONTROLS: &str =
    "tap | later | enable | revoke | send | discard | crop X,Y,W,H | again | stop";

async fn run_interactive(args: RunArgs) -> Result<()> {
    let review_mode = args.confirm.then_some(ReviewMode::Confirm);
    let Pipeline {
        service,
        mut events,
        review,
        mut reviews,
        analysis,
        mut answers,
        redirect_delay,
    } = start_pipeline(&args.common, review_mode)?;

    let printer = tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(event) = events.recv() => print_event(&event),
                Some(event) = reviews.recv() => print_review(&event),
                Some(answer) = answers.recv() => print_answer(&answer),
                else => break,
            }
        }
    });

    let (line_tx, mut line_rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        eprintln!("interactive controls: {CONTROLS}");
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });

    while let Some(line) = line_rx.recv().await {
        let line = line.trim().to_ascii_lowercase();
        let (command, rest) = line.split_once(' ').unwrap_or((line.as_str(), ""));
        let sent = match command {
            "tap" | "capture" => service.tap(),
            "later" => service.capture(Some(redirect_delay)),
            "enable" => service.enable(),
            "revoke" => service.revoke(),
            "send" | "confirm" => send_review(&review, ReviewCommand::Confirm),
            "discard" | "close" => send_review(&review, ReviewCommand::Discard),
            "again" | "reanalyze" => send_review(&review, ReviewCommand::Reanalyze),
            "crop" => match rest.parse::<CropRegion>() {
                Ok(region) => send_review(&review, ReviewCommand::Crop(region)),
                Err(err) => {
                    eprintln!("crop: {err}");
                    Ok(())
                }
            },
            "stop" | "quit" | "exit" => break,
            "" => Ok(()),
            _ => {
                eprintln!("unknown command. use: {CONTROLS}");
                Ok(())
            }
        };
        if let Err(err) = sent {
            eprintln!("{err}");
            break;
        }
    }

    drop(review);
    let summary = service.stop().await?;
    let analysis_summary = analysis.await.context("analysis worker failed")?;
    printer.await.context("event printer failed")?;

    println!(
        "{} activations: {} delivered, {} failed, {} rejected; {} answered",
        summary.activations,
        summary.delivered,
        summary.failed,
        summary.rejected,
        analysis_summary.answered
    );
    Ok(())
}

fn send_review(
    review: &mpsc::UnboundedSender<ReviewCommand>,
    command: ReviewCommand,
) -> Result<(), CaptureError> {
    review
        .send(command)
        .map_err(|_| CaptureError::unavailable("review stage is not running"))
}

fn print_event(event: &CoordinatorEvent) {
    match event {
        CoordinatorEvent::Started => println!("capture service started"),
        CoordinatorEvent::StateChanged(state) => log::debug!("state: {state:?}"),
        CoordinatorEvent::Delivered {
            activation,
            width,
            height,
            encoded_bytes,
        } => println!("capture #{activation}: {width}x{height}, {encoded_bytes} bytes"),
        CoordinatorEvent::Failed { activation, error } => {
            eprintln!("capture #{activation} failed: {}", error.user_message());
            log::debug!("capture #{activation}: {error}");
            if error.suggests_retry() {
                eprintln!("type `tap` to try again");
            }
            if matches!(error, CaptureError::PermissionDenied) {
                eprintln!("{}", screen_recording_help_message());
            }
        }
        CoordinatorEvent::Rejected { error } => eprintln!("{}", error.user_message()),
        CoordinatorEvent::Stopped => println!("capture service stopped"),
    }
}

fn print_review(event: &ReviewEvent) {
    match event {
        ReviewEvent::Pending {
            capture,
            width,
            height,
        } => println!(
            "capture #{capture} ({width}x{height}) is waiting: send | crop X,Y,W,H | discard"
        ),
        ReviewEvent::Cropped {
            capture,
            width,
            height,
        } => println!("capture #{capture} cropped to {width}x{height}"),
        ReviewEvent::Submitted {
            capture,
            width,
            height,
        } => println!("capture #{capture} ({width}x{height}) sent for analysis"),
        ReviewEvent::Discarded { capture } => println!("capture #{capture} discarded"),
        ReviewEvent::Refused { error } => eprintln!("{error}"),
    }
}

fn print_answer(event: &AnalysisEvent) {
    match event {
        AnalysisEvent::Answered { sequence, answer } => {
            println!("--- answer #{sequence} ---\n{answer}\n");
        }
        AnalysisEvent::Failed { sequence, message } => {
            eprintln!("answer #{sequence} failed: {message}");
        }
    }
}

fn print_permission_status(open_settings: bool) {
    let status = screen_recording_status();
    match status {
        ScreenRecordingStatus::Granted => println!("screen recording: granted"),
        ScreenRecordingStatus::NotSupported => {
            println!("screen recording: no permission required on this platform")
        }
        ScreenRecordingStatus::Denied => println!("screen recording: denied"),
    }

    if status.needs_user_action() {
        println!("{}", screen_recording_help_message());
        if open_settings && let Err(err) = open_screen_recording_settings() {
            eprintln!("Unable to auto-open System Settings: {err}");
        }
    }
}

#![allow(non_snake_case)]

use conference_client::config::Config;
use conference_client::controls::ControlCommand;
use conference_client::devices::DesktopDevices;
use conference_client::session::{join_room, new_room_id, SessionHandle};
use conference_client::video::{FrameBoard, LOCAL_PREVIEW};
use conference_client::view::{NoticeLevel, RemoteTile, SessionPhase, ViewModel};

use dioxus::prelude::*;
use dioxus_desktop::{Config as DesktopConfig, WindowBuilder};
use std::sync::Arc;

struct AppProps {
    config: Config,
}

fn main() {
    conference_client::init_logging();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(2);
        }
    };

    dioxus_desktop::launch_with_props(
        App,
        AppProps { config },
        DesktopConfig::new().with_window(WindowBuilder::new().with_title("Video Conference")),
    );
}

fn App(cx: Scope<AppProps>) -> Element {
    let session = use_state(cx, || None::<SessionHandle>);
    let view = use_state(cx, ViewModel::default);
    let room_input = use_state(cx, String::new);
    let lobby_error = use_state(cx, || None::<String>);
    let joining = use_state(cx, || false);
    let frames: &FrameBoard = cx.use_hook(FrameBoard::new);
    let frame_tick = use_state(cx, || 0u64);

    // Repaint whenever a tile gets a new frame.
    use_future(cx, (), |_| {
        let mut ticks = frames.subscribe();
        to_owned![frame_tick];
        async move {
            while ticks.changed().await.is_ok() {
                let tick = *ticks.borrow();
                frame_tick.set(tick);
            }
        }
    });

    let join = move |room: String| {
        let room = room.trim().to_string();
        if room.is_empty() {
            lobby_error.set(Some("Please enter a room id".to_string()));
            return;
        }
        let config = cx.props.config.clone();
        let frames = frames.clone();
        to_owned![session, view, lobby_error, joining];
        joining.set(true);

        cx.spawn(async move {
            let devices = Arc::new(DesktopDevices::new(config.ffmpeg_path.clone(), frames.clone()));
            match join_room(&config, &room, devices, frames).await {
                Ok(handle) => {
                    let mut view_rx = handle.view();
                    session.set(Some(handle));
                    lobby_error.set(None);
                    joining.set(false);

                    loop {
                        let current = view_rx.borrow_and_update().clone();
                        let left = current.phase == SessionPhase::Left;
                        view.set(current);
                        if left || view_rx.changed().await.is_err() {
                            break;
                        }
                    }

                    // Back to the lobby
                    session.set(None);
                    view.set(ViewModel::default());
                }
                Err(e) => {
                    tracing::error!("failed to join room {}: {}", room, e);
                    lobby_error.set(Some(e.to_string()));
                    joining.set(false);
                }
            }
        });
    };

    cx.use_hook(|| {
        if let Some(room) = cx.props.config.initial_room.clone() {
            join(room);
        }
    });

    if let Some(handle) = session.get() {
        let handle = handle.clone();
        return cx.render(rsx! {
            style { include_str!("./style.css") }
            RoomView {
                view: view.get(),
                frames: frames,
                on_command: move |command: ControlCommand| handle.send(command)
            }
        });
    }

    let username = &cx.props.config.username;
    cx.render(rsx! {
        style { include_str!("./style.css") }
        div { class: "lobby",
            h1 { "Video Conference" }
            p { class: "lobby-user", "Joining as {username}" }
            input {
                id: "roomId",
                placeholder: "Room id",
                value: "{room_input}",
                disabled: "{*joining.get()}",
                oninput: move |evt| room_input.set(evt.value.clone())
            }
            button {
                onclick: move |_| join(room_input.get().clone()),
                disabled: "{*joining.get()}",
                "Join Room"
            }
            button {
                onclick: move |_| join(new_room_id()),
                disabled: "{*joining.get()}",
                "Create Room"
            }
            {lobby_error.get().as_ref().map(|error| rsx!(
                div { class: "error-message", "{error}" }
            ))}
        }
    })
}

#[derive(Props)]
struct RoomViewProps<'a> {
    view: &'a ViewModel,
    frames: &'a FrameBoard,
    on_command: EventHandler<'a, ControlCommand>,
}

fn RoomView<'a>(cx: Scope<'a, RoomViewProps<'a>>) -> Element {
    let view = cx.props.view;
    let frames = cx.props.frames;
    let local_frame = match view.local.video_enabled {
        Some(true) => frames.get(LOCAL_PREVIEW),
        _ => None,
    };
    let mute_icon = view.controls.mute.name();
    let video_icon = view.controls.video.name();
    let record_icon = view.controls.record.name();
    let mic_state = match view.local.audio_enabled {
        Some(true) => "mic on",
        Some(false) => "muted",
        None => "no microphone",
    };
    let camera_state = match view.local.video_enabled {
        Some(true) => "camera on",
        Some(false) => "camera off",
        None => "no camera",
    };
    let record_class = if view.recording { "recording" } else { "" };
    let participant_count = view.participants.len();

    cx.render(rsx! {
        div { class: "room",
            h2 { "Room {view.room}" }

            div { class: "video-grid",
                div { class: "video-tile local",
                    {local_frame.map(|src| rsx!(
                        img { class: "video-frame", src: "{src}" }
                    ))}
                    span { class: "tile-name", "You" }
                    {(!view.local.available).then(|| rsx!(
                        span { class: "tile-status", "media unavailable" }
                    ))}
                    {view.local.available.then(|| rsx!(
                        span { class: "tile-status", "{mic_state}, {camera_state}" }
                    ))}
                }
                view.tiles.iter().map(|tile| rsx! {
                    RemoteVideo {
                        key: "{tile.peer_id}",
                        tile: tile.clone(),
                        frame: frames.get(&tile.peer_id)
                    }
                })
            }

            div { class: "participants",
                h3 { "Participants ({participant_count})" }
                ul {
                    view.participants.iter().map(|peer_id| rsx! {
                        li { key: "{peer_id}", "{peer_id}" }
                    })
                }
            }

            div { class: "control-bar",
                button {
                    title: "Mute",
                    onclick: move |_| cx.props.on_command.call(ControlCommand::ToggleMute),
                    i { class: "fas fa-{mute_icon}" }
                }
                button {
                    title: "Video",
                    onclick: move |_| cx.props.on_command.call(ControlCommand::ToggleVideo),
                    i { class: "fas fa-{video_icon}" }
                }
                button {
                    class: "{record_class}",
                    title: "Record",
                    onclick: move |_| cx.props.on_command.call(ControlCommand::ToggleRecord),
                    i { class: "fas fa-{record_icon}" }
                }
                button {
                    class: "leave",
                    title: "Leave",
                    onclick: move |_| cx.props.on_command.call(ControlCommand::Leave),
                    i { class: "fas fa-phone-slash" }
                }
            }

            div { class: "notices",
                view.notices.iter().map(|notice| {
                    let class = notice_class(notice.level);
                    rsx! {
                        div { class: "notice {class}", "{notice.message}" }
                    }
                })
            }

            {view.alert.as_ref().map(|alert| rsx!(
                div { class: "alert-backdrop",
                    div { class: "alert",
                        p { "{alert}" }
                        button {
                            onclick: move |_| cx.props.on_command.call(ControlCommand::DismissAlert),
                            "OK"
                        }
                    }
                }
            ))}
        }
    })
}

#[derive(Props, PartialEq)]
struct RemoteVideoProps {
    tile: RemoteTile,
    frame: Option<Arc<str>>,
}

fn RemoteVideo(cx: Scope<RemoteVideoProps>) -> Element {
    let tile = &cx.props.tile;
    let media = match (tile.has_audio, tile.has_video) {
        (true, true) => "audio + video",
        (true, false) => "audio",
        (false, true) => "video",
        (false, false) => "connecting",
    };

    cx.render(rsx! {
        div { class: "video-tile",
            {cx.props.frame.as_ref().map(|src| rsx!(
                img { class: "video-frame", src: "{src}" }
            ))}
            span { class: "tile-name", "{tile.peer_id}" }
            span { class: "tile-status", "{media}" }
        }
    })
}

fn notice_class(level: NoticeLevel) -> &'static str {
    match level {
        NoticeLevel::Info => "notice-info",
        NoticeLevel::Warning => "notice-warning",
        NoticeLevel::Error => "notice-error",
    }
}

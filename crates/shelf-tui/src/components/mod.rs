pub mod speech_panel;
pub mod task_panel;

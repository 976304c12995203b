pub mod config;
pub mod supabase;
pub mod telegram;
pub mod whisper;

//! Chat platform adapters.

pub mod telegram;
pub mod traits;

pub use telegram::TelegramChannel;
pub use traits::{
    CallbackQuery, ChannelError, ChannelResult, DownloadedFile, InboundContent, InboundEvent,
    InboundMessage, InlineButton, ParseMode, Transport,
};

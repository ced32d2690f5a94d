//! 收件箱同步演示
//!
//! 使用内存后端模拟一位教练和三位学员：全量加载、实时推送、打开会话、
//! 已读失败回滚、全部标记已读、焦点刷新和退出登录。

use std::sync::Arc;
use std::time::Duration;

use fitcoach_sdk::{CurrentUser, FitcoachConfig, FitcoachSDK, InboxEvent, MemoryBackend, Role, ViewContext};

fn print_contacts(title: &str, contacts: &[fitcoach_sdk::Contact]) {
    println!("\n📋 {}", title);
    for contact in contacts {
        println!(
            "   {:<14} 未读 {:>2}  {}",
            contact.name,
            contact.unread_count,
            contact.last_message.as_deref().unwrap_or("暂无消息")
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("\n🚀 Fitcoach 收件箱同步演示\n");

    let backend = Arc::new(MemoryBackend::new());
    backend.add_profile(1, "Coach Li", Role::Professor);
    backend.add_profile(2, "Wang Fang", Role::Student);
    backend.add_profile(3, "Zhao Lei", Role::Student);
    backend.add_profile(4, "Chen Jing", Role::Student);

    backend.send_message(2, 1, "教练，今天的深蹲做完了");
    backend.send_message(2, 1, "膝盖有点酸");
    backend.send_message(3, 1, "周五的课可以改到周六吗？");
    backend.send_message(1, 3, "可以，周六上午十点");

    let data_dir = std::env::temp_dir().join("fitcoach_inbox_demo");
    let config = FitcoachConfig::builder()
        .data_dir(&data_dir)
        .focus_settle_delay_ms(200)
        .build();

    let sdk = FitcoachSDK::initialize(config, backend.clone(), backend.clone()).await?;
    sdk.events()
        .add_listener("read_mark_failed", |event| {
            if let InboxEvent::ReadMarkFailed { contact_id, error, .. } = event {
                println!("   🔔 提示：已读标记失败 contact={:?} ({})", contact_id, error);
            }
        })
        .await;

    let session = sdk.sign_in(CurrentUser::new(1, "Coach Li", Role::Professor)).await?;
    session.set_view(ViewContext::ContactList);
    print_contacts("登录后的联系人列表", &session.contacts());

    // 实时推送：陈静发来新消息
    let mut chen_events = session.subscribe_contact_events(4);
    backend.send_message(4, 1, "我想加一节核心训练");
    if let Ok(Ok(event)) = tokio::time::timeout(Duration::from_millis(200), chen_events.recv()).await {
        println!("\n📨 陈静的会话事件: {}", event.event_type());
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    print_contacts("收到陈静的实时消息后", &session.contacts());

    // 打开会话失败：未读数回滚
    backend.set_fail_mark_read(true);
    if let Err(e) = session.open_conversation(2).await {
        println!("\n❌ 打开王芳的会话时标记已读失败: {}", e);
    }
    println!("   王芳未读数已恢复为 {:?}", session.unread_count(2));

    // 重新打开：成功
    backend.set_fail_mark_read(false);
    let messages = session.open_conversation(2).await?;
    println!("\n💬 与王芳的会话（{} 条）", messages.len());
    for message in &messages {
        println!("   [{}] {}", message.sender_id, message.content);
    }
    session.close_conversation();

    // 全部标记已读
    let outcome = session.mark_all_read().await?;
    println!("\n✅ 全部标记已读: 发送 {} 条, 跳过 {} 条", outcome.sent, outcome.skipped);
    print_contacts("全部已读后", &session.contacts());

    // 失焦期间漏掉的消息，通过焦点刷新收敛
    session.on_blur().await?;
    backend.drop_subscriptions();
    backend.send_message(3, 1, "收到，周六见");
    session.on_focus().await?;
    session.wait_focus_refresh().await;
    print_contacts("焦点刷新后", &session.contacts());

    println!("\n📊 命令统计: {} 次 mark_read 调用", backend.mark_read_calls().len());

    sdk.sign_out().await?;
    sdk.shutdown().await?;
    println!("\n👋 已退出登录\n");
    Ok(())
}

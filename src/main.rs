use log::{error, info, warn};

use sysfs_gpio::{AppConfig, Direction, EdgeCallback, GpioError, SysfsGpioController};

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::io::Result<()> {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("SYSFS_GPIO_CONFIG").ok())
        .unwrap_or_else(|| "config.json".to_string());
    let config = AppConfig::load_from_file(&config_path)
        .unwrap_or_else(|e| panic!("Failed to load config: {e}"));

    let mut controller =
        SysfsGpioController::new(&config.sysfs).map_err(std::io::Error::other)?;

    if let Err(e) = allocate_configured_pins(&mut controller, &config) {
        controller.shutdown();
        return Err(std::io::Error::other(e));
    }

    info!(
        "Watching {} pins, press Ctrl-C to stop",
        controller.allocated_pins().len()
    );

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            res = &mut ctrl_c => {
                if let Err(e) = res {
                    warn!("Ctrl-C handler failed: {e}");
                }
                break;
            }
            res = controller.process_next_event() => {
                if let Err(e) = res {
                    error!("{e}, edge interrupts are no longer delivered");
                    break;
                }
            }
        }
    }

    controller.shutdown();
    Ok(())
}

fn allocate_configured_pins(
    controller: &mut SysfsGpioController,
    config: &AppConfig,
) -> Result<(), GpioError> {
    let mut numbers: Vec<u32> = config.gpios.keys().copied().collect();
    numbers.sort_unstable();

    for number in numbers {
        let pin_cfg = &config.gpios[&number];
        let label = pin_cfg
            .name
            .clone()
            .unwrap_or_else(|| format!("gpio{number}"));

        let callback: Option<EdgeCallback> = pin_cfg.edge.map(|_| {
            let label = label.clone();
            Box::new(move |number: u32, level: u8| {
                info!("{label} (pin {number}) changed to {level}")
            }) as EdgeCallback
        });

        controller.allocate(
            number,
            pin_cfg.direction,
            callback,
            pin_cfg.edge,
            pin_cfg.active_low()?,
        )?;

        if pin_cfg.direction == Direction::Output
            && let Some(level) = pin_cfg.initial_level
        {
            controller.set_level(number, level)?;
        }

        info!("Allocated {label} as pin {number} ({})", pin_cfg.direction);
    }

    Ok(())
}

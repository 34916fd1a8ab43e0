//! Deadline timer behavior: one-shot, repeating, restart, deferral.

use anyhow::Result;
use meridian_sockets::{DeadlineTimer, EventLoop, RunMode};
use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

#[test]
fn one_shot_fires_exactly_once() -> Result<()> {
    let lp = EventLoop::new()?;
    let fired = Rc::new(Cell::new(0usize));

    let timer = DeadlineTimer::new(&lp);
    {
        let fired = fired.clone();
        let this = timer.clone();
        timer.start_wait(Duration::from_millis(20), None, move || {
            fired.set(fired.get() + 1);
            this.close(|| {});
        });
    }
    assert!(timer.is_waiting());

    let started = Instant::now();
    lp.run(RunMode::Default)?;
    assert_eq!(fired.get(), 1);
    assert!(started.elapsed() >= Duration::from_millis(20));
    Ok(())
}

#[test]
fn repeating_timer_fires_until_stopped() -> Result<()> {
    let lp = EventLoop::new()?;
    let fired = Rc::new(Cell::new(0usize));

    let timer = DeadlineTimer::new(&lp);
    {
        let fired = fired.clone();
        let this = timer.clone();
        timer.start_wait(
            Duration::from_millis(5),
            Some(Duration::from_millis(5)),
            move || {
                fired.set(fired.get() + 1);
                if fired.get() == 3 {
                    this.stop_wait();
                    this.close(|| {});
                }
            },
        );
    }

    lp.run(RunMode::Default)?;
    assert_eq!(fired.get(), 3);
    Ok(())
}

#[test]
fn restart_replaces_the_pending_wait() -> Result<()> {
    let lp = EventLoop::new()?;
    let slow_fired = Rc::new(Cell::new(false));
    let fast_fired = Rc::new(Cell::new(false));

    let timer = DeadlineTimer::new(&lp);
    {
        let slow = slow_fired.clone();
        timer.start_wait(Duration::from_secs(60), None, move || slow.set(true));
    }
    {
        let fast = fast_fired.clone();
        let this = timer.clone();
        // Re-arming while waiting restarts with the new parameters.
        timer.start_wait(Duration::from_millis(10), None, move || {
            fast.set(true);
            this.close(|| {});
        });
    }

    lp.run(RunMode::Default)?;
    assert!(fast_fired.get());
    assert!(!slow_fired.get());
    Ok(())
}

#[test]
fn handler_can_rearm_a_one_shot() -> Result<()> {
    let lp = EventLoop::new()?;
    let fired = Rc::new(Cell::new(0usize));

    let timer = DeadlineTimer::new(&lp);
    {
        let fired = fired.clone();
        let this = timer.clone();
        timer.start_wait(Duration::from_millis(5), None, move || {
            fired.set(fired.get() + 1);
            let fired = fired.clone();
            let that = this.clone();
            // A one-shot disarms before its handler runs; re-arm by hand.
            this.start_wait(Duration::from_millis(5), None, move || {
                fired.set(fired.get() + 1);
                that.close(|| {});
            });
        });
    }

    lp.run(RunMode::Default)?;
    assert_eq!(fired.get(), 2);
    Ok(())
}

#[test]
fn timer_callback_is_deferred_even_at_zero_timeout() -> Result<()> {
    let lp = EventLoop::new()?;
    let fired = Rc::new(Cell::new(false));

    let timer = DeadlineTimer::new(&lp);
    {
        let fired = fired.clone();
        let this = timer.clone();
        timer.start_wait(Duration::ZERO, None, move || {
            fired.set(true);
            this.close(|| {});
        });
    }
    // Never synchronous within the issuing call.
    assert!(!fired.get());

    lp.run(RunMode::Default)?;
    assert!(fired.get());
    Ok(())
}

#[test]
fn stop_wait_is_a_noop_when_idle() -> Result<()> {
    let lp = EventLoop::new()?;
    let timer = DeadlineTimer::new(&lp);
    timer.stop_wait();
    assert!(!timer.is_waiting());
    assert_eq!(lp.run(RunMode::Default)?, false);
    Ok(())
}
